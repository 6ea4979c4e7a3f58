//! Two-peer tests for geo-sync.
//!
//! Each peer is a drawing store bridged to its own Loro document through a
//! `CollabSession`. Peers exchange `RoomMessage` bytes directly, standing in
//! for a network relay.

use std::sync::{Arc, Mutex};

use geo_sync::{
    BridgeEvent, CollabSession, DrawEvent, Feature, InMemoryFeatureStore, LocalFeatureStore,
    MapChange, ReplicatedFeatureMap, RoomName, SessionConfig, Subscription,
};
use serde_json::json;

const ROOM: &str = "war-map-test001";

struct Peer {
    session: CollabSession,
    store: Arc<InMemoryFeatureStore>,
}

impl Peer {
    /// A peer whose drawing tool is already loaded.
    fn ready() -> Self {
        let peer = Self::with_store(InMemoryFeatureStore::new());
        peer.store.finish_loading();
        peer
    }

    /// A peer whose store holds `store`'s contents before the bridge exists.
    fn with_store(store: InMemoryFeatureStore) -> Self {
        let config = SessionConfig::new(RoomName::new(ROOM).unwrap());
        let mut session = CollabSession::start(config).expect("Failed to start session");
        let store = Arc::new(store);
        session.attach(store.clone(), store.events());
        Self { session, store }
    }

    /// Send `other` everything it is missing from us.
    fn push_to(&self, other: &Peer) {
        if other.session.version().includes_vv(&self.session.version()) {
            return;
        }
        let message = self
            .session
            .update_message(&other.session.version())
            .expect("Failed to export update");
        other.session.receive(&message).expect("Failed to import update");
    }

    /// Count writes this peer makes to its own document.
    fn record_local_writes(&self) -> (Arc<Mutex<usize>>, Subscription) {
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);
        let sub = self.session.map().observe(Arc::new(move |change: &MapChange| {
            if change.is_local_origin {
                *count_clone.lock().unwrap() += 1;
            }
        }));
        (count, sub)
    }
}

fn sync(a: &Peer, b: &Peer) {
    a.push_to(b);
    b.push_to(a);
}

fn point(x: f64, y: f64) -> serde_json::Value {
    json!({ "type": "Point", "coordinates": [x, y] })
}

fn square(size: f64) -> serde_json::Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [size, 0.0], [size, size], [0.0, size], [0.0, 0.0]]]
    })
}

fn assert_converged(a: &Peer, b: &Peer) {
    assert_eq!(a.store.snapshot(), b.store.snapshot(), "stores diverged");
    assert_eq!(a.session.map().entries(), b.session.map().entries(), "maps diverged");
}

#[test]
fn test_remote_feature_is_not_echoed() {
    let a = Peer::ready();
    let b = Peer::ready();
    let (a_writes, _sub) = a.record_local_writes();

    b.store.draw(Feature::new(point(1.0, 2.0)).with_id("f1"));
    b.push_to(&a);

    assert!(a.store.contains("f1"));
    assert_eq!(*a_writes.lock().unwrap(), 0);
    assert_converged(&a, &b);
}

#[test]
fn test_reconcile_adopts_room_state() {
    let a = Peer::ready();
    a.store.draw(Feature::new(point(1.0, 1.0)).with_id("a"));
    a.store.draw(Feature::new(point(2.0, 2.0)).with_id("b"));

    let drafts = InMemoryFeatureStore::new();
    drafts.import_feature(Feature::new(point(9.0, 9.0)).with_id("b")).unwrap();
    drafts.import_feature(Feature::new(point(3.0, 3.0)).with_id("c")).unwrap();
    let b = Peer::with_store(drafts);

    // Arrives before the drawing tool is ready
    b.session
        .receive(&a.session.snapshot_message().unwrap())
        .unwrap();
    assert!(b.store.contains("c"));

    let (b_writes, _sub) = b.record_local_writes();
    b.store.finish_loading();

    assert_eq!(b.store.ids(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(b.store.get("b").unwrap().geometry(), &point(2.0, 2.0));
    assert_eq!(*b_writes.lock().unwrap(), 0);
    assert_converged(&a, &b);
}

#[test]
fn test_repeated_update_is_idempotent() {
    let a = Peer::ready();
    let b = Peer::ready();

    let since = b.session.version();
    a.store.draw(Feature::new(point(1.0, 1.0)).with_id("x"));
    let message = a.session.update_message(&since).unwrap();

    b.session.receive(&message).unwrap();
    let first = b.store.snapshot();

    let applied = Arc::new(Mutex::new(0));
    let applied_clone = Arc::clone(&applied);
    let _sub = b.session.bridge().unwrap().subscribe(move |event| {
        if matches!(event, BridgeEvent::RemoteBatchApplied { .. }) {
            *applied_clone.lock().unwrap() += 1;
        }
    });

    b.session.receive(&message).unwrap();

    assert_eq!(b.store.snapshot(), first);
    assert_eq!(*applied.lock().unwrap(), 0);
}

#[test]
fn test_created_without_id_is_keyed_everywhere() {
    let a = Peer::ready();
    let b = Peer::ready();

    a.store
        .events()
        .emit(DrawEvent::Created(Feature::new(point(4.0, 4.0))));
    a.push_to(&b);

    let entries = a.session.map().entries();
    assert_eq!(entries.len(), 1);
    let (key, published) = &entries[0];
    assert!(!key.is_empty());
    assert_eq!(published.id(), Some(key.as_str()));
    assert_eq!(b.store.get(key).unwrap().geometry(), &point(4.0, 4.0));
}

#[test]
fn test_delete_propagates() {
    let a = Peer::ready();
    let b = Peer::ready();

    let id = a.store.draw(Feature::new(square(1.0)));
    a.push_to(&b);
    assert!(b.store.contains(&id));

    a.store.erase(&id);
    a.push_to(&b);

    assert!(!b.store.contains(&id));
    assert!(b.session.map().is_empty());
    assert_converged(&a, &b);
}

#[test]
fn test_cut_fans_out_to_peers() {
    let a = Peer::ready();
    let b = Peer::ready();

    let id = a.store.draw(Feature::new(square(2.0)).with_property("name", json!("zone")));
    a.push_to(&b);

    let pieces = a.store.cut(&id, vec![square(1.0), point(1.5, 1.5)]);
    assert_eq!(pieces.len(), 2);
    a.push_to(&b);

    assert!(!b.store.contains(&id));
    for piece in &pieces {
        let received = b.store.get(piece).unwrap();
        assert_eq!(received.property("name"), Some(&json!("zone")));
    }
    assert_converged(&a, &b);
}

#[test]
fn test_edits_flow_both_ways() {
    let a = Peer::ready();
    let b = Peer::ready();

    let id = a.store.draw(Feature::new(square(1.0)));
    sync(&a, &b);

    b.store.drag(&id, square(3.0));
    sync(&a, &b);
    assert_eq!(a.store.get(&id).unwrap().geometry(), &square(3.0));

    a.store.rotate(&id, square(4.0));
    sync(&a, &b);
    assert_eq!(b.store.get(&id).unwrap().geometry(), &square(4.0));
    assert_converged(&a, &b);
}

#[test]
fn test_concurrent_edits_converge() {
    let a = Peer::ready();
    let b = Peer::ready();

    let id = a.store.draw(Feature::new(square(1.0)));
    sync(&a, &b);

    a.store.edit(&id, square(5.0));
    b.store.edit(&id, square(6.0));
    sync(&a, &b);

    assert_converged(&a, &b);
    assert_eq!(a.store.len(), 1);
}

#[test]
fn test_ended_session_stops_mirroring() {
    let a = Peer::ready();
    let mut b = Peer::ready();

    b.session.end();
    a.store.draw(Feature::new(point(1.0, 1.0)).with_id("late"));
    a.push_to(&b);

    assert!(b.session.map().keys().contains("late"));
    assert!(!b.store.contains("late"));
}
