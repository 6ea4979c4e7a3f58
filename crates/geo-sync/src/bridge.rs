//! FeatureSyncBridge: keeps a local drawing store and a replicated feature
//! map in agreement.
//!
//! Local to remote: every `DrawEvent` that changes geometry is upserted into
//! the map, every removal deletes the key. Remote to local: change batches
//! that did not originate here are applied to the store with delete-then-
//! import, under a `RemoteApplyGuard` so the store's own notifications about
//! those mutations are not published back.
//!
//! ```text
//! DrawEvent ──guard check──> ReplicatedFeatureMap::set/delete
//! MapChange (remote) ──guard set──> LocalFeatureStore::delete/import ──guard cleared
//! DrawEvent::Loaded ──> one-time reconciliation
//! ```

use crate::events::{now_millis, BridgeEvent, EventBus, Subscription};
use crate::feature::Feature;
use crate::guard::RemoteApplyGuard;
use crate::map::{MapChange, ReplicatedFeatureMap};
use crate::reconcile::ReconcileReport;
use crate::store::{DrawEvent, LocalFeatureStore};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Bridge lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Wiring,
    Active,
    Destroyed,
}

/// State shared between the bridge handle and its subscriptions.
///
/// Subscriptions hold only a `Weak` reference, so a callback that fires after
/// the handle is gone finds nothing to upgrade and returns.
pub(crate) struct BridgeInner {
    pub(crate) store: Arc<dyn LocalFeatureStore>,
    pub(crate) map: Arc<dyn ReplicatedFeatureMap>,
    guard: RemoteApplyGuard,
    /// Serializes remote batches and reconciliation.
    apply_lock: Mutex<()>,
    ready: AtomicBool,
    lifecycle: RwLock<Lifecycle>,
    pub(crate) monitor: Arc<EventBus<BridgeEvent>>,
}

impl BridgeInner {
    fn new(store: Arc<dyn LocalFeatureStore>, map: Arc<dyn ReplicatedFeatureMap>) -> Self {
        Self {
            store,
            map,
            guard: RemoteApplyGuard::new(),
            apply_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            monitor: Arc::new(EventBus::new()),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *self.lifecycle.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run `f` as a remote-to-local application: one batch at a time, with
    /// the guard set on this thread. Re-entrant calls run `f` directly.
    pub(crate) fn with_remote_apply<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.guard.is_applying() {
            return f();
        }
        let _lock = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _scope = self.guard.enter();
        f()
    }

    /// Ids currently held by the local store. Features without an id are skipped.
    pub(crate) fn local_ids(&self) -> BTreeSet<String> {
        self.store
            .export_features()
            .iter()
            .filter_map(|f| f.id().map(str::to_string))
            .collect()
    }

    // ========== Local -> Remote ==========

    fn on_draw_event(&self, event: DrawEvent) {
        if self.is_destroyed() {
            return;
        }

        if matches!(event, DrawEvent::Loaded) {
            self.on_loaded();
            return;
        }

        if self.guard.is_applying() {
            debug!("Skipping {} raised while applying remote changes", event.name());
            return;
        }

        let trigger = event.name();
        match event {
            DrawEvent::Created(feature) => self.upsert(feature, trigger),
            DrawEvent::EditEnded(feature)
            | DrawEvent::DragEnded(feature)
            | DrawEvent::RotateEnded(feature) => {
                if let Some(feature) = feature {
                    self.upsert(feature, trigger);
                }
            }
            DrawEvent::Cut(features) => {
                for feature in features {
                    self.upsert(feature, trigger);
                }
            }
            DrawEvent::Removed(feature) => self.remove(&feature),
            DrawEvent::Loaded => {}
        }
    }

    /// Publish a full replacement of `feature`, assigning an id if it has none.
    fn upsert(&self, mut feature: Feature, trigger: &str) {
        let id = feature.ensure_id().to_string();
        match self.map.set(&id, &feature) {
            Ok(()) => {
                debug!("Published {} ({})", id, trigger);
                self.monitor.emit(BridgeEvent::FeaturePublished {
                    id,
                    trigger: trigger.to_string(),
                    timestamp: now_millis(),
                });
            }
            Err(e) => warn!("Failed to publish {} ({}): {}", id, trigger, e),
        }
    }

    fn remove(&self, feature: &Feature) {
        // Never published without an id
        let Some(id) = feature.id() else {
            debug!("Ignoring removal of a feature without id");
            return;
        };
        match self.map.delete(id) {
            Ok(()) => {
                debug!("Retracted {}", id);
                self.monitor.emit(BridgeEvent::FeatureRetracted {
                    id: id.to_string(),
                    timestamp: now_millis(),
                });
            }
            Err(e) => warn!("Failed to retract {}: {}", id, e),
        }
    }

    // ========== Remote -> Local ==========

    fn on_map_change(&self, change: &MapChange) {
        if self.is_destroyed() {
            return;
        }
        // Already applied locally by the write that produced it
        if change.is_local_origin {
            return;
        }
        if !self.is_ready() {
            debug!(
                "Local store not ready, deferring {} remote change(s) to reconciliation",
                change.changed_keys.len()
            );
            return;
        }

        let (imported, removed) = self.with_remote_apply(|| self.apply_remote_batch(change));

        debug!("Applied remote batch: {} imported, {} removed", imported, removed);
        self.monitor.emit(BridgeEvent::RemoteBatchApplied {
            imported,
            removed,
            timestamp: now_millis(),
        });
    }

    /// Apply one remote batch. Must run inside `with_remote_apply`.
    fn apply_remote_batch(&self, change: &MapChange) -> (usize, usize) {
        let local_ids = self.local_ids();
        let mut imported = 0;
        let mut removed = 0;

        for key in &change.changed_keys {
            let exists_locally = local_ids.contains(key);
            match self.map.get(key) {
                Ok(Some(feature)) => {
                    if self.replace_local(key, feature, exists_locally) {
                        imported += 1;
                    }
                }
                Ok(None) => {
                    if exists_locally && self.delete_local(key) {
                        removed += 1;
                    }
                }
                Err(e) => warn!("Skipping remote change for {}: {}", key, e),
            }
        }

        (imported, removed)
    }

    /// Replace (or create) the local copy of `id` with `feature`.
    ///
    /// The store has no replace primitive, so an existing feature is deleted
    /// before the new payload is imported. The map key wins over whatever id
    /// the payload carries.
    pub(crate) fn replace_local(&self, id: &str, mut feature: Feature, exists_locally: bool) -> bool {
        if exists_locally && !self.delete_local(id) {
            return false;
        }
        if feature.id() != Some(id) {
            feature.set_id(id);
        }
        match self.store.import_feature(feature) {
            Ok(()) => true,
            Err(e) => {
                warn!("Local store rejected {}: {}", id, e);
                false
            }
        }
    }

    pub(crate) fn delete_local(&self, id: &str) -> bool {
        match self.store.delete_feature(id) {
            Ok(()) => true,
            Err(e) => {
                warn!("Local store failed to delete {}: {}", id, e);
                false
            }
        }
    }

    // ========== Readiness ==========

    fn on_loaded(&self) {
        if self.ready.swap(true, Ordering::SeqCst) {
            debug!("Local store reported ready again, ignoring");
            return;
        }
        info!("Local store ready, reconciling with replicated map");
        self.reconcile();
    }
}

/// Handle returned by `FeatureSyncBridge::setup`.
///
/// Dropping the handle destroys the bridge.
pub struct FeatureSyncBridge {
    inner: Arc<BridgeInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FeatureSyncBridge {
    /// Wire a local store and a replicated map together.
    ///
    /// `draw_events` is the store's event stream, including its one-time
    /// `Loaded` readiness signal. All subscriptions are registered before this
    /// returns; the bridge is then `Active`.
    pub fn setup(
        store: Arc<dyn LocalFeatureStore>,
        draw_events: &Arc<EventBus<DrawEvent>>,
        map: Arc<dyn ReplicatedFeatureMap>,
    ) -> Self {
        let inner = Arc::new(BridgeInner::new(store, map));
        inner.set_lifecycle(Lifecycle::Wiring);

        let weak = Arc::downgrade(&inner);
        let draw_subscription = draw_events.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_draw_event(event);
            }
        });

        let weak = Arc::downgrade(&inner);
        let map_subscription = inner.map.observe(Arc::new(move |change: &MapChange| {
            if let Some(inner) = weak.upgrade() {
                inner.on_map_change(change);
            }
        }));

        inner.set_lifecycle(Lifecycle::Active);
        info!("Feature sync bridge active");

        Self {
            inner,
            subscriptions: Mutex::new(vec![draw_subscription, map_subscription]),
        }
    }

    /// Release every subscription. Terminal and safe to call more than once.
    pub fn destroy(&self) {
        if self.inner.is_destroyed() {
            return;
        }
        self.inner.set_lifecycle(Lifecycle::Destroyed);

        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        drop(subscriptions);

        info!("Feature sync bridge destroyed");
        self.inner.monitor.emit(BridgeEvent::Destroyed {
            timestamp: now_millis(),
        });
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    /// Whether the local store has signalled readiness (and reconciliation ran).
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Subscribe to bridge events for monitoring.
    pub fn subscribe(&self, callback: impl Fn(BridgeEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.monitor.subscribe(callback)
    }

    /// Run reconciliation again.
    ///
    /// Only meaningful once the store is ready; before that, or after
    /// destruction, returns an empty report without touching either store.
    pub fn reconcile(&self) -> ReconcileReport {
        if self.inner.is_destroyed() {
            return ReconcileReport::default();
        }
        if !self.inner.is_ready() {
            debug!("Reconcile requested before local store is ready, skipping");
            return ReconcileReport::default();
        }
        self.inner.reconcile()
    }
}

impl Drop for FeatureSyncBridge {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for FeatureSyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureSyncBridge")
            .field("lifecycle", &self.lifecycle())
            .field("ready", &self.is_ready())
            .finish()
    }
}
