//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod file_document;
pub mod mirror_session;
pub mod watcher;

// Re-export key types for convenience
pub use file_document::FileDocument;
pub use mirror_session::{MirrorSession, SCRIPT_PATH_ENV};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
