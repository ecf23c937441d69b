//! Diagram session backed by a mirror `.drawio` file.
//!
//! The mirror is what a desktop diagram editor has open. Loads and merges
//! overwrite it; edits saved by the editor come back through
//! `reload_from_disk`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sync_core::session::{DiagramSession, Result, SessionError, SessionEvent};
use sync_core::xml::escape_attribute_value;
use sync_core::EventBus;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Environment variable naming the file that holds the script being updated.
pub const SCRIPT_PATH_ENV: &str = "DIAGRAM_SYNC_SCRIPT";

/// Default limit for one converter run.
pub const DEFAULT_CONVERTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Diagram session over a mirror file on disk.
pub struct MirrorSession {
    path: PathBuf,
    /// Program and arguments of the script converter.
    converter: Option<Vec<String>>,
    converter_timeout: Duration,
    /// Diagram XML last written to or read from the mirror.
    model: RwLock<Option<String>>,
    events: Arc<EventBus<SessionEvent>>,
    closed: AtomicBool,
}

impl MirrorSession {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            converter: None,
            converter_timeout: DEFAULT_CONVERTER_TIMEOUT,
            model: RwLock::new(None),
            events: Arc::new(EventBus::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Use `command` (program followed by its arguments) for script
    /// conversion. It reads diagram XML on stdin, finds the script to update
    /// in the file named by `DIAGRAM_SYNC_SCRIPT` and prints the updated script.
    pub fn with_converter(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.converter = Some(command);
        }
        self
    }

    /// Kill converter runs taking longer than `timeout`.
    pub fn with_converter_timeout(mut self, timeout: Duration) -> Self {
        self.converter_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up an edit saved into the mirror by the editor.
    ///
    /// Returns false when the mirror still holds what we last saw, which
    /// includes the echo of our own writes.
    pub async fn reload_from_disk(&self) -> Result<bool> {
        self.ensure_open()?;
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SessionError::Rejected(format!("{}: {}", self.path.display(), e)))?;

        {
            let mut model = self.model.write().unwrap_or_else(|e| e.into_inner());
            if model.as_deref() == Some(text.as_str()) {
                return Ok(false);
            }
            *model = Some(text.clone());
        }

        debug!("Mirror {} changed on disk", self.path.display());
        self.events.emit(SessionEvent::Changed { payload: text });
        Ok(true)
    }

    /// Stop accepting commands. Later calls fail with `Unavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SessionError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Remember `xml` as the current model; returns false if it already was.
    fn set_model(&self, xml: &str) -> bool {
        let mut model = self.model.write().unwrap_or_else(|e| e.into_inner());
        if model.as_deref() == Some(xml) {
            return false;
        }
        *model = Some(xml.to_string());
        true
    }

    fn current_model(&self) -> Option<String> {
        self.model.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Write the mirror from synchronous code. On a multi-thread runtime the
    /// worker is handed over to the blocking pool for the duration.
    fn write_blocking(&self, xml: &str) -> Result<()> {
        let write = || std::fs::write(&self.path, xml);
        let result = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(write)
            }
            _ => write(),
        };
        result.map_err(|e| SessionError::Rejected(format!("{}: {}", self.path.display(), e)))
    }
}

/// Diagram XML carried by `text`: the text itself for `mxfile` and
/// `mxGraphModel` documents, the `content` attribute of an embedded SVG.
fn extract_diagram(text: &str) -> Option<String> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    let doc = roxmltree::Document::parse_with_options(text, options).ok()?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "mxfile" | "mxGraphModel" => Some(text.to_string()),
        "svg" => root.attribute("content").map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl DiagramSession for MirrorSession {
    fn load(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let Some(xml) = extract_diagram(text) else {
            // Scripts and foreign text carry no diagram; the mirror keeps its own
            debug!("No diagram in loaded text, keeping {}", self.path.display());
            return Ok(());
        };
        if self.set_model(&xml) {
            self.write_blocking(&xml)?;
        }
        Ok(())
    }

    async fn merge(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let Some(xml) = extract_diagram(text) else {
            debug!("No diagram in merged text, keeping {}", self.path.display());
            return Ok(());
        };
        if self.set_model(&xml) {
            tokio::fs::write(&self.path, &xml)
                .await
                .map_err(|e| SessionError::Rejected(format!("{}: {}", self.path.display(), e)))?;
        }
        Ok(())
    }

    async fn export_embedded_image(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let model = self
            .current_model()
            .ok_or_else(|| SessionError::Rejected("mirror holds no diagram".to_string()))?;

        // Headless export: no rendering, only the editable model
        let svg = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<svg xmlns=\"{}\" version=\"1.1\" width=\"1px\" height=\"1px\" viewBox=\"-0.5 -0.5 1 1\" content=\"{}\"/>",
            SVG_NS,
            escape_attribute_value(&model)
        );
        Ok(svg.into_bytes())
    }

    async fn convert_to_script(&self, xml: &str, existing: &str) -> Result<String> {
        self.ensure_open()?;
        let Some((program, args)) = self.converter.as_ref().and_then(|c| c.split_first()) else {
            return Err(SessionError::Conversion("no converter configured".to_string()));
        };
        let failed = |e: std::io::Error| SessionError::Conversion(format!("{}: {}", program, e));

        // The converter updates the flow inside this copy of the script
        let script = NamedTempFile::new().map_err(failed)?;
        tokio::fs::write(script.path(), existing).await.map_err(failed)?;

        let mut child = Command::new(program)
            .args(args)
            .env(SCRIPT_PATH_ENV, script.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(failed)?;

        // Stdin is fed while the output is drained, or a converter blocked on
        // a full stdout pipe never reads the rest of its input
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(xml.as_bytes()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let run = async { tokio::join!(feed, child.wait_with_output()) };

        let (fed, output) = tokio::time::timeout(self.converter_timeout, run)
            .await
            .map_err(|_| {
                warn!("Converter {} timed out after {:?}", program, self.converter_timeout);
                SessionError::Conversion(format!(
                    "{} timed out after {:?}",
                    program, self.converter_timeout
                ))
            })?;
        let output = output.map_err(failed)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Converter {} exited with {}", program, output.status);
            return Err(SessionError::Conversion(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        match fed {
            // Converters may succeed without reading all of their input
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("Converter {} closed stdin early", program)
            }
            Err(e) => return Err(failed(e)),
            Ok(()) => {}
        }

        String::from_utf8(output.stdout).map_err(|e| SessionError::Conversion(e.to_string()))
    }

    fn events(&self) -> Arc<EventBus<SessionEvent>> {
        Arc::clone(&self.events)
    }
}
