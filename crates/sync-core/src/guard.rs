//! Re-entrancy guard for the two propagation directions.
//!
//! Writing into the session makes it emit its own change event, and replacing
//! the document text makes the host emit a document change. While a
//! propagation is in flight in one direction, further events for that same
//! direction are dropped.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

/// Direction of a propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// External document text pushed into the diagram session.
    ExternalToSession,
    /// Diagram session payload written back to the external document.
    SessionToExternal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ExternalToSession => write!(f, "external->session"),
            Direction::SessionToExternal => write!(f, "session->external"),
        }
    }
}

/// Two independent in-flight flags, one per direction.
#[derive(Debug, Default)]
pub struct ChangeGuard {
    external_to_session: AtomicBool,
    session_to_external: AtomicBool,
}

/// Held while a propagation runs. Clears its flag when dropped, which also
/// covers errors, panics and cancelled futures.
#[must_use = "the guard is released as soon as the token is dropped"]
pub struct GuardToken<'a> {
    flag: &'a AtomicBool,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ChangeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::ExternalToSession => &self.external_to_session,
            Direction::SessionToExternal => &self.session_to_external,
        }
    }

    /// Whether a propagation is currently in flight for `direction`.
    pub fn is_held(&self, direction: Direction) -> bool {
        self.flag(direction).load(Ordering::Acquire)
    }

    /// Take the flag for `direction`, or `None` if it is already held.
    pub fn try_acquire(&self, direction: Direction) -> Option<GuardToken<'_>> {
        let flag = self.flag(direction);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken { flag })
    }

    /// Run `action` with the flag for `direction` held.
    ///
    /// Returns `None` without polling `action` if the flag is already held:
    /// the event is dropped, not queued.
    pub async fn run_guarded<F, T>(&self, direction: Direction, action: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _token = self.try_acquire(direction)?;
        Some(action.await)
    }
}
