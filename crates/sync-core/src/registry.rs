//! SyncRegistry: one attached synchronizer per open diagram session,
//! addressable by `SessionId`.

use crate::config::SyncConfig;
use crate::document::DocumentHost;
use crate::events::{EventBus, SyncEvent};
use crate::session::DiagramSession;
use crate::synchronizer::{DocumentSynchronizer, Result, SyncBinding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Identity of one open diagram session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns the synchronizers of all open sessions.
///
/// Failures stay scoped to the session they happen in; all synchronizers
/// report to the registry's shared diagnostics bus.
pub struct SyncRegistry {
    config: SyncConfig,
    diagnostics: Arc<EventBus<SyncEvent>>,
    sessions: Mutex<HashMap<SessionId, SyncBinding>>,
}

impl SyncRegistry {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            diagnostics: Arc::new(EventBus::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Diagnostics emitted by every synchronizer of this registry.
    pub fn diagnostics(&self) -> Arc<EventBus<SyncEvent>> {
        Arc::clone(&self.diagnostics)
    }

    /// Bind `session` to `document` and start synchronizing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        document: Arc<dyn DocumentHost>,
        session: Arc<dyn DiagramSession>,
    ) -> Result<SessionId> {
        let synchronizer = Arc::new(DocumentSynchronizer::new(
            document,
            session,
            &self.config,
            Arc::clone(&self.diagnostics),
        ));
        let binding = synchronizer.attach()?;

        let id = SessionId::new();
        info!(
            "Opened session {} for {} ({:?}{})",
            id,
            synchronizer.uri(),
            synchronizer.format(),
            if synchronizer.is_read_only() { ", read-only" } else { "" }
        );
        self.lock().insert(id, binding);
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<DocumentSynchronizer>> {
        self.lock()
            .get(&id)
            .map(|binding| Arc::clone(binding.synchronizer()))
    }

    /// Detach and drop the session's synchronizer. Returns false if unknown.
    pub fn close(&self, id: SessionId) -> bool {
        let binding = self.lock().remove(&id);
        match binding {
            Some(binding) => {
                info!("Closed session {} ({})", id, binding.synchronizer().uri());
                binding.dispose();
                true
            }
            None => false,
        }
    }

    /// Close every open session.
    pub fn close_all(&self) {
        let bindings: Vec<_> = self.lock().drain().collect();
        for (id, binding) in bindings {
            info!("Closed session {} ({})", id, binding.synchronizer().uri());
            binding.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SyncBinding>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
