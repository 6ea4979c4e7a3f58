//! Local feature store abstraction: the drawing tool's side of the bridge.
//!
//! The store is owned by the drawing/editing tool. The bridge only issues
//! `import_feature` / `delete_feature` commands against it and listens to the
//! `DrawEvent`s it emits.
//!
//! Implementations:
//! - `InMemoryFeatureStore` - For testing and the simulator

use crate::events::EventBus;
use crate::feature::Feature;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Feature rejected: {0}")]
    Rejected(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Lifecycle events fired by the drawing tool.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawEvent {
    /// A feature was drawn.
    Created(Feature),
    /// Vertex editing finished.
    EditEnded(Option<Feature>),
    /// Drag gesture finished.
    DragEnded(Option<Feature>),
    /// Rotate gesture finished.
    RotateEnded(Option<Feature>),
    /// A cut produced these features (one element when the cut only
    /// modified a single feature).
    Cut(Vec<Feature>),
    /// A feature was removed.
    Removed(Feature),
    /// The tool finished initializing and is safe to mutate. Fired once.
    Loaded,
}

impl DrawEvent {
    /// Short event name, used for logging and as the publish trigger.
    pub fn name(&self) -> &'static str {
        match self {
            DrawEvent::Created(_) => "create",
            DrawEvent::EditEnded(_) => "editend",
            DrawEvent::DragEnded(_) => "dragend",
            DrawEvent::RotateEnded(_) => "rotateend",
            DrawEvent::Cut(_) => "cut",
            DrawEvent::Removed(_) => "remove",
            DrawEvent::Loaded => "loaded",
        }
    }
}

/// Commands and queries the bridge needs from the drawing tool.
pub trait LocalFeatureStore: Send + Sync {
    /// Add a feature. The store assigns its own handles.
    fn import_feature(&self, feature: Feature) -> Result<()>;

    /// Remove a feature by id. No-op if absent.
    fn delete_feature(&self, id: &str) -> Result<()>;

    /// Snapshot of every feature currently held.
    fn export_features(&self) -> Vec<Feature>;
}

impl<T: LocalFeatureStore + ?Sized> LocalFeatureStore for Arc<T> {
    fn import_feature(&self, feature: Feature) -> Result<()> {
        (**self).import_feature(feature)
    }

    fn delete_feature(&self, id: &str) -> Result<()> {
        (**self).delete_feature(id)
    }

    fn export_features(&self) -> Vec<Feature> {
        (**self).export_features()
    }
}

/// In-memory drawing store.
///
/// Every mutation is reported on `events()`, including mutations made through
/// `import_feature` / `delete_feature`, the way drawing tools notify all
/// changes regardless of who caused them. Features created here always get
/// an id. Events are emitted after internal locks are released.
pub struct InMemoryFeatureStore {
    features: RwLock<BTreeMap<String, Feature>>,
    events: Arc<EventBus<DrawEvent>>,
    loaded: AtomicBool,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self {
            features: RwLock::new(BTreeMap::new()),
            events: Arc::new(EventBus::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// The event stream the bridge subscribes to.
    pub fn events(&self) -> &Arc<EventBus<DrawEvent>> {
        &self.events
    }

    pub fn get(&self, id: &str) -> Option<Feature> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Id-keyed copy of the store contents.
    pub fn snapshot(&self) -> BTreeMap<String, Feature> {
        self.read().clone()
    }

    /// Draw a new feature. Returns its id.
    pub fn draw(&self, mut feature: Feature) -> String {
        let id = feature.ensure_id().to_string();
        self.write().insert(id.clone(), feature.clone());
        self.events.emit(DrawEvent::Created(feature));
        id
    }

    /// Finish a vertex edit with new geometry. Returns false if `id` is unknown.
    pub fn edit(&self, id: &str, geometry: serde_json::Value) -> bool {
        self.reshape(id, geometry)
            .map(|f| self.events.emit(DrawEvent::EditEnded(Some(f))))
            .is_some()
    }

    /// Finish a drag with new geometry. Returns false if `id` is unknown.
    pub fn drag(&self, id: &str, geometry: serde_json::Value) -> bool {
        self.reshape(id, geometry)
            .map(|f| self.events.emit(DrawEvent::DragEnded(Some(f))))
            .is_some()
    }

    /// Finish a rotation with new geometry. Returns false if `id` is unknown.
    pub fn rotate(&self, id: &str, geometry: serde_json::Value) -> bool {
        self.reshape(id, geometry)
            .map(|f| self.events.emit(DrawEvent::RotateEnded(Some(f))))
            .is_some()
    }

    /// Cut feature `id` into `pieces`.
    ///
    /// A single piece replaces the feature in place and keeps its id. Several
    /// pieces replace the original: it is removed and every piece is stored
    /// under its own id. Returns the ids of the resulting features.
    pub fn cut(&self, id: &str, pieces: Vec<serde_json::Value>) -> Vec<String> {
        if pieces.len() == 1 {
            let Some(geometry) = pieces.into_iter().next() else {
                return Vec::new();
            };
            return match self.reshape(id, geometry) {
                Some(feature) => {
                    self.events.emit(DrawEvent::Cut(vec![feature]));
                    vec![id.to_string()]
                }
                None => Vec::new(),
            };
        }

        let (original, results) = {
            let mut features = self.write();
            let Some(original) = features.remove(id) else {
                return Vec::new();
            };
            let results: Vec<Feature> = pieces
                .into_iter()
                .map(|geometry| {
                    let mut piece = original.clone();
                    piece.set_id(uuid::Uuid::new_v4().to_string());
                    piece.set_geometry(geometry);
                    features.insert(piece.id().unwrap_or_default().to_string(), piece.clone());
                    piece
                })
                .collect();
            (original, results)
        };

        let ids = results
            .iter()
            .filter_map(|f| f.id().map(str::to_string))
            .collect();
        self.events.emit(DrawEvent::Removed(original));
        self.events.emit(DrawEvent::Cut(results));
        ids
    }

    /// Erase a feature. Returns false if `id` is unknown.
    pub fn erase(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        match removed {
            Some(feature) => {
                self.events.emit(DrawEvent::Removed(feature));
                true
            }
            None => false,
        }
    }

    /// Signal that the tool finished initializing. Only the first call emits.
    pub fn finish_loading(&self) {
        if !self.loaded.swap(true, Ordering::SeqCst) {
            self.events.emit(DrawEvent::Loaded);
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn reshape(&self, id: &str, geometry: serde_json::Value) -> Option<Feature> {
        let mut features = self.write();
        let feature = features.get_mut(id)?;
        feature.set_geometry(geometry);
        Some(feature.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Feature>> {
        self.features.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Feature>> {
        self.features.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryFeatureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFeatureStore for InMemoryFeatureStore {
    fn import_feature(&self, mut feature: Feature) -> Result<()> {
        if !feature.geometry().is_object() && !feature.geometry().is_null() {
            return Err(StoreError::Rejected(format!(
                "geometry of {} is not an object",
                feature.id().unwrap_or("<no id>")
            )));
        }

        let id = feature.ensure_id().to_string();
        let replaced = self.write().insert(id, feature.clone());
        if let Some(previous) = replaced {
            self.events.emit(DrawEvent::Removed(previous));
        }
        self.events.emit(DrawEvent::Created(feature));
        Ok(())
    }

    fn delete_feature(&self, id: &str) -> Result<()> {
        let removed = self.write().remove(id);
        if let Some(feature) = removed {
            self.events.emit(DrawEvent::Removed(feature));
        }
        Ok(())
    }

    fn export_features(&self) -> Vec<Feature> {
        self.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(store: &InMemoryFeatureStore) -> (Arc<Mutex<Vec<DrawEvent>>>, crate::Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let sub = store.events().subscribe(move |event| {
            log_clone.lock().unwrap().push(event);
        });
        (log, sub)
    }

    fn line() -> serde_json::Value {
        json!({ "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] })
    }

    #[test]
    fn test_draw_assigns_id_and_emits_created() {
        let store = InMemoryFeatureStore::new();
        let (log, _sub) = recorder(&store);

        let id = store.draw(Feature::new(line()));

        assert!(store.contains(&id));
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DrawEvent::Created(f) => assert_eq!(f.id(), Some(id.as_str())),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_edit_drag_rotate_emit_their_events() {
        let store = InMemoryFeatureStore::new();
        let id = store.draw(Feature::new(line()));
        let (log, _sub) = recorder(&store);

        assert!(store.edit(&id, json!({ "type": "Point", "coordinates": [1.0, 0.0] })));
        assert!(store.drag(&id, json!({ "type": "Point", "coordinates": [2.0, 0.0] })));
        assert!(store.rotate(&id, json!({ "type": "Point", "coordinates": [3.0, 0.0] })));
        assert!(!store.edit("missing", line()));

        let names: Vec<_> = log.lock().unwrap().iter().map(DrawEvent::name).collect();
        assert_eq!(names, vec!["editend", "dragend", "rotateend"]);
        assert_eq!(
            store.get(&id).unwrap().geometry(),
            &json!({ "type": "Point", "coordinates": [3.0, 0.0] })
        );
    }

    #[test]
    fn test_cut_into_one_piece_keeps_id() {
        let store = InMemoryFeatureStore::new();
        let id = store.draw(Feature::new(line()));

        let ids = store.cut(&id, vec![json!({ "type": "Point", "coordinates": [0.0, 0.0] })]);

        assert_eq!(ids, vec![id.clone()]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cut_into_pieces_replaces_original() {
        let store = InMemoryFeatureStore::new();
        let id = store.draw(Feature::new(line()).with_property("kind", json!("road")));
        let (log, _sub) = recorder(&store);

        let ids = store.cut(&id, vec![line(), line()]);

        assert_eq!(ids.len(), 2);
        assert!(!store.contains(&id));
        for piece in &ids {
            assert_eq!(store.get(piece).unwrap().property("kind"), Some(&json!("road")));
        }
        let names: Vec<_> = log.lock().unwrap().iter().map(DrawEvent::name).collect();
        assert_eq!(names, vec!["remove", "cut"]);
    }

    #[test]
    fn test_erase() {
        let store = InMemoryFeatureStore::new();
        let id = store.draw(Feature::new(line()));
        let (log, _sub) = recorder(&store);

        assert!(store.erase(&id));
        assert!(!store.erase(&id));
        assert!(store.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_commands_are_reported() {
        let store = InMemoryFeatureStore::new();
        let (log, _sub) = recorder(&store);

        store.import_feature(Feature::new(line()).with_id("a")).unwrap();
        store.import_feature(Feature::new(line()).with_id("a")).unwrap();
        store.delete_feature("a").unwrap();
        store.delete_feature("a").unwrap();

        let names: Vec<_> = log.lock().unwrap().iter().map(DrawEvent::name).collect();
        assert_eq!(names, vec!["create", "remove", "create", "remove"]);
    }

    #[test]
    fn test_import_rejects_scalar_geometry() {
        let store = InMemoryFeatureStore::new();
        let result = store.import_feature(Feature::new(json!(12)).with_id("bad"));

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_finish_loading_emits_once() {
        let store = InMemoryFeatureStore::new();
        let (log, _sub) = recorder(&store);

        store.finish_loading();
        store.finish_loading();

        assert!(store.is_loaded());
        assert_eq!(*log.lock().unwrap(), vec![DrawEvent::Loaded]);
    }
}
