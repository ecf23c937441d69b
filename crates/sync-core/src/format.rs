//! Output text per document format.
//!
//! Every persisted file is tagged with `host="<ORIGIN_ID>"` so files written
//! by this tool can be told apart from files written by other diagram
//! editor distributions.

use crate::config::FormatSuffixes;
use crate::session::{DiagramSession, SessionError};
use crate::xml::{self, Writer};
use roxmltree::NodeId;
use thiserror::Error;
use tracing::debug;

/// Origin marker written into the `host` attribute.
pub const ORIGIN_ID: &str = "65bd71144e";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Output is not well-formed XML: {0}")]
    Parse(String),

    #[error("Exported image is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Script conversion failed: {0}")]
    Conversion(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, FormatError>;

/// On-disk representation of a document, fixed by its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Raw diagram XML (`.drawio`, `.dio`).
    DiagramXml,
    /// SVG image with the diagram XML embedded (`.drawio.svg`).
    EmbeddedSvg,
    /// Scripting-language source converted from the diagram.
    ConvertedScript,
}

impl OutputFormat {
    /// Pick the format from a file name's suffix (case-insensitive).
    ///
    /// The longest matching suffix across all three lists wins, so a diagram
    /// suffix such as `.flow.py` can override the script suffix `.py`. Names
    /// matching nothing are diagram XML.
    pub fn from_file_name(name: &str, suffixes: &FormatSuffixes) -> Self {
        let name = name.to_ascii_lowercase();
        let candidates = [
            (OutputFormat::ConvertedScript, &suffixes.script),
            (OutputFormat::EmbeddedSvg, &suffixes.svg),
            (OutputFormat::DiagramXml, &suffixes.diagram),
        ];

        let mut best: Option<(usize, OutputFormat)> = None;
        for (format, list) in candidates {
            if let Some(len) = longest_match(&name, list) {
                if best.is_none_or(|(best_len, _)| len > best_len) {
                    best = Some((len, format));
                }
            }
        }

        match best {
            Some((_, format)) => format,
            None => {
                debug!("No known suffix on {}, treating it as diagram XML", name);
                OutputFormat::DiagramXml
            }
        }
    }
}

/// Length of the longest suffix in `suffixes` that `name` ends with.
fn longest_match(name: &str, suffixes: &[String]) -> Option<usize> {
    suffixes
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| !s.is_empty() && name.ends_with(s.as_str()))
        .map(|s| s.len())
        .max()
}

/// Produces the exact text to persist for a session payload.
#[derive(Debug, Clone)]
pub struct FormatPipeline {
    indent: usize,
}

impl FormatPipeline {
    pub fn new(indent: usize) -> Self {
        Self { indent }
    }

    /// Render `raw_payload` (diagram XML from the session) for `format`.
    ///
    /// `current` is the text persisted for the document right now; script
    /// conversion updates it in place instead of starting from scratch.
    /// `FormatError::Conversion` means the previous text must be kept as is.
    pub async fn render(
        &self,
        format: OutputFormat,
        raw_payload: &str,
        current: &str,
        session: &dyn DiagramSession,
    ) -> Result<String> {
        match format {
            OutputFormat::DiagramXml => self.tag_and_pretty_print(raw_payload, "mxfile"),
            OutputFormat::EmbeddedSvg => {
                let bytes = session.export_embedded_image().await?;
                let svg = String::from_utf8(bytes)?;
                self.tag_and_pretty_print(svg.trim_start_matches('\u{feff}'), "svg")
            }
            OutputFormat::ConvertedScript => match session.convert_to_script(raw_payload, current).await {
                Ok(script) => Ok(script),
                Err(SessionError::Unavailable) => Err(SessionError::Unavailable.into()),
                Err(e) => Err(FormatError::Conversion(e.to_string())),
            },
        }
    }

    /// Put the origin marker first on the first `anchor` element (the root
    /// element if there is none) and pretty-print the whole document.
    fn tag_and_pretty_print(&self, text: &str, anchor: &str) -> Result<String> {
        let doc = xml::parse(text).map_err(|e| FormatError::Parse(e.to_string()))?;
        let root = doc.root_element();
        let target: NodeId = doc
            .descendants()
            .find(|n| n.has_tag_name(anchor))
            .unwrap_or(root)
            .id();

        let mut out = String::new();
        // XML declaration and DOCTYPE are not nodes; keep them verbatim
        let prolog = text[..root.range().start].trim();
        if !prolog.is_empty() {
            out.push_str(prolog);
            out.push('\n');
        }

        let rewrite = |node: roxmltree::Node<'_, '_>, attrs: &mut xml::Attributes| {
            if node.id() == target {
                xml::set_first_attribute(attrs, "host", ORIGIN_ID);
            }
        };
        let mut writer = Writer::new(Some(self.indent), &rewrite);
        writer.top_level(root);
        let mut next = root.next_sibling();
        while let Some(node) = next {
            writer.top_level(node);
            next = node.next_sibling();
        }
        out.push_str(&writer.finish());
        out.push('\n');
        Ok(out)
    }
}

impl Default for FormatPipeline {
    fn default() -> Self {
        Self::new(2)
    }
}
