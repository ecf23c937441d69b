//! DiagramSession trait for the live diagram-editing instance.
//!
//! The editing engine itself is a black box: it accepts load/merge commands,
//! exports images and script conversions, and emits `SessionEvent`s.
//!
//! Implementations:
//! - `MirrorSession` (in sync-daemon) - a mirror `.drawio` file edited elsewhere
//! - test fakes recording every call

use crate::events::EventBus;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is no longer available")]
    Unavailable,

    #[error("Session rejected the command: {0}")]
    Rejected(String),

    #[error("Script conversion failed: {0}")]
    Conversion(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Events emitted by a diagram session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The diagram changed; `payload` is the full diagram XML.
    Changed { payload: String },
    /// The session finished booting and wants its initial content.
    Initialized,
    /// The user asked the session to save (e.g. Ctrl+S inside the editor).
    SaveRequested,
}

/// Commands accepted by a live diagram session.
#[async_trait]
pub trait DiagramSession: Send + Sync {
    /// Replace the session's content. Called once, after `Initialized`.
    fn load(&self, text: &str) -> Result<()>;

    /// Merge an externally edited document into the session.
    async fn merge(&self, text: &str) -> Result<()>;

    /// Export the current diagram as SVG bytes with the diagram XML embedded.
    async fn export_embedded_image(&self) -> Result<Vec<u8>>;

    /// Convert diagram XML into scripting-language source.
    ///
    /// `existing` is the script currently persisted for the document. A
    /// converter updates the flow definition inside it and keeps every other
    /// line, so hand-written code survives diagram edits.
    async fn convert_to_script(&self, xml: &str, existing: &str) -> Result<String>;

    /// Event stream of this session.
    fn events(&self) -> Arc<EventBus<SessionEvent>>;
}
