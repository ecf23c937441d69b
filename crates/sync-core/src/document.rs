//! DocumentHost trait for the external text document.
//!
//! The host owns the text and its revision counter; the synchronizer only
//! observes changes and proposes whole-document replacements.
//!
//! Implementations:
//! - `InMemoryDocument` - For testing
//! - `FileDocument` (in sync-daemon) - a buffer over a file on disk

use crate::events::EventBus;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Host rejected the edit: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Document is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Stable identity of a document: scheme plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentUri {
    pub scheme: String,
    pub path: String,
}

impl DocumentUri {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    /// A `file` URI for a local path.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new("file", path)
    }

    /// Parse `scheme:path`; text without a scheme is treated as a file path.
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            // Single letters are drive prefixes, not schemes
            Some((scheme, rest)) if scheme.len() > 1 && is_scheme(scheme) => {
                Self::new(scheme, rest.trim_start_matches("//"))
            }
            _ => Self::file(text),
        }
    }

    /// File name part of the path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit(['/', '\\']).next().unwrap_or(&self.path)
    }

    /// Whether this document lives on a scheme in `read_only_schemes`.
    pub fn is_read_only(&self, read_only_schemes: &[String]) -> bool {
        read_only_schemes.iter().any(|s| s == &self.scheme)
    }
}

fn is_scheme(text: &str) -> bool {
    text.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl std::fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// One contiguous edit, in byte offsets of the previous text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub offset: usize,
    pub removed: usize,
    pub inserted: String,
}

impl TextChange {
    /// A change replacing all of `old` with `new`.
    pub fn whole(old: &str, new: &str) -> Self {
        Self {
            offset: 0,
            removed: old.len(),
            inserted: new.to_string(),
        }
    }
}

/// Events emitted by a document host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// The text changed. `changes` may be empty when the host only touched
    /// metadata (dirty flag, save state).
    Changed {
        revision: u64,
        text: String,
        changes: Vec<TextChange>,
    },
}

/// The text-editing surface that owns the document.
#[async_trait]
pub trait DocumentHost: Send + Sync {
    fn uri(&self) -> &DocumentUri;

    /// Current revision; bumped on every content change.
    fn revision(&self) -> u64;

    /// Full current text.
    async fn text(&self) -> Result<String>;

    /// Replace the entire text.
    async fn replace_text(&self, text: &str) -> Result<()>;

    /// Persist the current text.
    async fn save(&self) -> Result<()>;

    /// Event stream of this document.
    fn events(&self) -> Arc<EventBus<DocumentEvent>>;
}

struct Buffer {
    text: String,
    revision: u64,
    saved: Option<String>,
}

/// In-memory document for testing.
pub struct InMemoryDocument {
    uri: DocumentUri,
    buffer: RwLock<Buffer>,
    events: Arc<EventBus<DocumentEvent>>,
    reject_edits: RwLock<Option<String>>,
}

impl InMemoryDocument {
    pub fn new(uri: DocumentUri, text: &str) -> Self {
        Self {
            uri,
            buffer: RwLock::new(Buffer {
                text: text.to_string(),
                revision: 0,
                saved: None,
            }),
            events: Arc::new(EventBus::new()),
            reject_edits: RwLock::new(None),
        }
    }

    /// Simulate a user edit: update the text and emit a change event.
    pub fn edit(&self, text: &str) {
        let event = {
            let mut buffer = self.buffer.write().unwrap_or_else(|e| e.into_inner());
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
    }

    /// Make `replace_text` fail with `reason` (None to accept again).
    pub fn reject_edits(&self, reason: Option<&str>) {
        *self.reject_edits.write().unwrap_or_else(|e| e.into_inner()) = reason.map(String::from);
    }

    /// Text written by the last `save`.
    pub fn saved_text(&self) -> Option<String> {
        self.buffer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .saved
            .clone()
    }

    /// Current text without going through the async trait.
    pub fn current_text(&self) -> String {
        self.buffer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .text
            .clone()
    }
}

#[async_trait]
impl DocumentHost for InMemoryDocument {
    fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    fn revision(&self) -> u64 {
        self.buffer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .revision
    }

    async fn text(&self) -> Result<String> {
        Ok(self.current_text())
    }

    async fn replace_text(&self, text: &str) -> Result<()> {
        if let Some(reason) = self
            .reject_edits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(DocumentError::Rejected(reason));
        }
        self.edit(text);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let mut buffer = self.buffer.write().unwrap_or_else(|e| e.into_inner());
        buffer.saved = Some(buffer.text.clone());
        Ok(())
    }

    fn events(&self) -> Arc<EventBus<DocumentEvent>> {
        Arc::clone(&self.events)
    }
}
