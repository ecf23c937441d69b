//! File-backed document host using tokio::fs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use sync_core::document::{DocumentError, DocumentEvent, DocumentHost, DocumentUri, Result, TextChange};
use sync_core::EventBus;
use tokio::fs;
use tracing::debug;

struct Buffer {
    text: String,
    revision: u64,
    /// Content last read from or written to disk.
    on_disk: String,
}

/// Document host over a file on disk.
///
/// Edits go to an in-memory buffer; `save` writes the buffer back.
pub struct FileDocument {
    uri: DocumentUri,
    path: PathBuf,
    buffer: RwLock<Buffer>,
    events: Arc<EventBus<DocumentEvent>>,
}

impl FileDocument {
    /// Open `path` as a `file` document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let uri = DocumentUri::file(path.to_string_lossy());
        Self::open_as(path, uri).await
    }

    /// Open `path` under an explicit URI (e.g. a `git` revision checked out
    /// to a temp file).
    pub async fn open_as(path: impl Into<PathBuf>, uri: DocumentUri) -> Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| DocumentError::Io(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            uri,
            path,
            buffer: RwLock::new(Buffer {
                text: text.clone(),
                revision: 0,
                on_disk: text,
            }),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up an external edit of the file.
    ///
    /// Returns false when the file matches the buffer, which includes the
    /// echo of our own `save`.
    pub async fn reload_from_disk(&self) -> Result<bool> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| DocumentError::Io(format!("{}: {}", self.path.display(), e)))?;

        let event = {
            let mut buffer = self.write_buffer();
            if buffer.text == text {
                buffer.on_disk = text;
                return Ok(false);
            }
            let change = TextChange::whole(&buffer.text, &text);
            buffer.text = text.clone();
            buffer.on_disk = text.clone();
            buffer.revision += 1;
            DocumentEvent::Changed {
                revision: buffer.revision,
                text,
                changes: vec![change],
            }
        };

        debug!("Reloaded {} from disk", self.path.display());
        self.events.emit(event);
        Ok(true)
    }

    /// Whether the buffer differs from the file content.
    pub fn is_dirty(&self) -> bool {
        let buffer = self.read_buffer();
        buffer.text != buffer.on_disk
    }

    fn read_buffer(&self) -> std::sync::RwLockReadGuard<'_, Buffer> {
        self.buffer.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_buffer(&self) -> std::sync::RwLockWriteGuard<'_, Buffer> {
        self.buffer.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentHost for FileDocument {
    fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    fn revision(&self) -> u64 {
        self.read_buffer().revision
    }

    async fn text(&self) -> Result<String> {
        Ok(self.read_buffer().text.clone())
    }

    async fn replace_text(&self, text: &str) -> Result<()> {
        let event = {
            let mut buffer = self.write_buffer();
            let change = TextChange::whole(&buffer.text, text);
            buffer.text = text.to_string();
            buffer.revision += 1;
            DocumentEvent::Changed {
                revision: buffer.revision,
                text: text.to_string(),
                changes: vec![change],
            }
        };
        self.events.emit(event);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let text = self.read_buffer().text.clone();

        // Create parent directories if needed
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DocumentError::Io(e.to_string()))?;
        }
        fs::write(&self.path, &text)
            .await
            .map_err(|e| DocumentError::Io(e.to_string()))?;

        self.write_buffer().on_disk = text;
        debug!("Saved {}", self.path.display());
        Ok(())
    }

    fn events(&self) -> Arc<EventBus<DocumentEvent>> {
        Arc::clone(&self.events)
    }
}
