//! Event infrastructure for sync-core.
//!
//! Provides a generic `EventBus` used for three streams:
//! - `DocumentEvent` emitted by a document host when its text changes
//! - `SessionEvent` emitted by a diagram session (change/init/save)
//! - `SyncEvent` emitted by a synchronizer for diagnostics and user notifications
//!
//! Subscribers hold a `Subscription`; dropping it detaches the callback.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::guard::Direction;

/// Diagnostic events emitted by a synchronizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A change was pushed from one side to the other.
    Propagated {
        /// Document the change belongs to.
        uri: String,
        /// Which way the change travelled.
        direction: Direction,
    },
    /// A change event was seen but nothing semantically changed.
    Unchanged {
        uri: String,
        direction: Direction,
    },
    /// Script conversion failed; the persisted text was left untouched.
    ConversionFailed {
        uri: String,
        message: String,
    },
    /// A propagation failed. Recoverable; meant to be shown to the user.
    PropagationFailed {
        uri: String,
        direction: Direction,
        message: String,
    },
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach now instead of waiting for drop.
    pub fn dispose(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(uri: &str) -> SyncEvent {
        SyncEvent::PropagationFailed {
            uri: uri.into(),
            direction: Direction::SessionToExternal,
            message: "host rejected edit".into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event: SyncEvent| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(failed("file:///a.drawio"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event: SyncEvent| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(failed("file:///a.drawio"));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(failed("file:///b.drawio"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_explicit_dispose() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count1 = Arc::clone(&count);
        let count2 = Arc::clone(&count);

        let sub1 = bus.subscribe(move |n| {
            count1.fetch_add(n as usize, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |n| {
            count2.fetch_add(n as usize, Ordering::Relaxed);
        });

        bus.emit(1);
        assert_eq!(count.load(Ordering::Relaxed), 2);

        sub1.dispose();
        bus.emit(10);
        assert_eq!(count.load(Ordering::Relaxed), 12);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});
        drop(bus);
        // Upgrading the weak reference fails; dropping must not panic.
        drop(sub);
    }

    #[test]
    fn test_sync_event_serialization() {
        let json = serde_json::to_string(&failed("file:///a.drawio")).unwrap();
        assert!(json.contains("\"type\":\"propagationFailed\""));
        assert!(json.contains("\"direction\":\"sessionToExternal\""));
        assert!(json.contains("\"message\":\"host rejected edit\""));
    }
}
