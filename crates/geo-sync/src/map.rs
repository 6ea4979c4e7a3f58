//! Replicated feature map abstraction: the shared side of the bridge.
//!
//! A map from feature id to GeoJSON payload, convergent across peers. Writes
//! are total replacements; concurrent writes to one key are resolved by the
//! CRDT underneath (last writer wins by its logical clock).
//!
//! Implementations:
//! - `LoroFeatureMap` - Loro document with one root map container

use crate::events::Subscription;
use crate::feature::{Feature, FeatureError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Malformed feature under key {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: FeatureError,
    },

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),
}

pub type Result<T> = std::result::Result<T, MapError>;

/// One change notification: the keys touched by an update batch and whether
/// that batch was written by this replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange {
    pub changed_keys: BTreeSet<String>,
    pub is_local_origin: bool,
}

/// Callback invoked for every change batch.
pub type MapObserver = Arc<dyn Fn(&MapChange) + Send + Sync>;

/// Operations the bridge needs from the replicated map.
pub trait ReplicatedFeatureMap: Send + Sync {
    /// Look up a feature. `Ok(None)` if the key is absent.
    fn get(&self, id: &str) -> Result<Option<Feature>>;

    /// Replace the value stored under `id`.
    fn set(&self, id: &str, feature: &Feature) -> Result<()>;

    /// Delete `id`. No-op if absent.
    fn delete(&self, id: &str) -> Result<()>;

    /// All keys currently present.
    fn keys(&self) -> BTreeSet<String>;

    /// All entries, in key order. Malformed values are skipped.
    fn entries(&self) -> Vec<(String, Feature)>;

    /// Register a change observer. Dropping the subscription unregisters it.
    fn observe(&self, observer: MapObserver) -> Subscription;
}

impl<T: ReplicatedFeatureMap + ?Sized> ReplicatedFeatureMap for Arc<T> {
    fn get(&self, id: &str) -> Result<Option<Feature>> {
        (**self).get(id)
    }

    fn set(&self, id: &str, feature: &Feature) -> Result<()> {
        (**self).set(id, feature)
    }

    fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id)
    }

    fn keys(&self) -> BTreeSet<String> {
        (**self).keys()
    }

    fn entries(&self) -> Vec<(String, Feature)> {
        (**self).entries()
    }

    fn observe(&self, observer: MapObserver) -> Subscription {
        (**self).observe(observer)
    }
}
