//! Event infrastructure for geo-sync.
//!
//! `EventBus<E>` carries drawing-tool events into the bridge and bridge
//! events out to monitors. `Subscription` is the disposer handed back by
//! every subscribe call in this crate, whether the source is an `EventBus`
//! or a CRDT observer.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Events emitted by the bridge for real-time monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// A local feature was written to the replicated map.
    FeaturePublished {
        id: String,
        /// Drawing-tool event that caused the write (e.g. "create", "cut").
        trigger: String,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// A local removal was written to the replicated map.
    FeatureRetracted {
        id: String,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// A remote batch was applied to the local store.
    RemoteBatchApplied {
        imported: usize,
        removed: usize,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Full reconciliation finished.
    Reconciled {
        imported: usize,
        removed: usize,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// The bridge was torn down.
    Destroyed {
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub(crate) fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or call `dispose`) to unsubscribe.
pub struct Subscription {
    dispose: Mutex<Option<Disposer>>,
}

impl Subscription {
    /// Wrap an arbitrary unsubscribe action. It runs at most once.
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// Unsubscribe now. Safe to call multiple times.
    pub fn dispose(&self) {
        let dispose = self
            .dispose
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    pub fn is_active(&self) -> bool {
        self.dispose
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe. Wrap in `Arc` to enable subscriptions.
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

impl<E: Clone + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription
    where
        E: Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so callbacks may subscribe or emit re-entrantly.
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

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
