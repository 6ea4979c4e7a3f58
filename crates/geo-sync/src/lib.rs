//! geo-sync: Bidirectional sync between a map drawing tool and a replicated
//! feature map built on Loro CRDTs.
//!
//! This crate provides:
//! - GeoJSON feature handling with stable string ids
//! - The `LocalFeatureStore` and `ReplicatedFeatureMap` abstractions
//! - `FeatureSyncBridge`, which mirrors changes in both directions without echo
//! - One-time reconciliation when the drawing tool becomes ready
//! - Collaboration sessions with a bincode wire envelope

pub mod bridge;
pub mod events;
pub mod feature;
pub mod guard;
pub mod loro_map;
pub mod map;
pub mod reconcile;
pub mod session;
pub mod store;

pub use bridge::{FeatureSyncBridge, Lifecycle};
pub use events::{BridgeEvent, EventBus, Subscription};
pub use feature::{Feature, FeatureError};
pub use guard::{ApplyScope, RemoteApplyGuard};
pub use loro_map::{LoroFeatureMap, DEFAULT_CONTAINER};
pub use map::{MapChange, MapError, MapObserver, ReplicatedFeatureMap};
pub use reconcile::ReconcileReport;
pub use session::{CollabSession, RoomMessage, RoomName, RoomNameError, SessionConfig, SessionError};
pub use store::{DrawEvent, InMemoryFeatureStore, LocalFeatureStore, StoreError};
