//! sync-core: Bidirectional sync between a diagram text document and a live
//! diagram-editing session.
//!
//! This crate provides the core functionality for:
//! - Normalizing diagram XML so cosmetic changes compare equal
//! - Rendering the on-disk text for each output format
//! - Guarding against reacting to our own writes
//! - Orchestrating both propagation directions per open session
//! - DocumentHost and DiagramSession trait abstractions

pub mod config;
pub mod document;
pub mod events;
pub mod format;
pub mod guard;
pub mod normalize;
pub mod registry;
pub mod session;
pub mod synchronizer;
pub mod xml;

pub use config::{ConfigError, FormatSuffixes, SyncConfig};
pub use document::{DocumentError, DocumentEvent, DocumentHost, DocumentUri, InMemoryDocument, TextChange};
pub use events::{EventBus, Subscription, SyncEvent};
pub use format::{FormatError, FormatPipeline, ORIGIN_ID, OutputFormat};
pub use guard::{ChangeGuard, Direction};
pub use normalize::{NormalizedSnapshot, normalize, normalize_for};
pub use registry::{SessionId, SyncRegistry};
pub use session::{DiagramSession, SessionError, SessionEvent};
pub use synchronizer::{DocumentSynchronizer, Outcome, SyncBinding, SyncError, SyncState};
