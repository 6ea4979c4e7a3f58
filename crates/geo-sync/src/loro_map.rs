//! LoroFeatureMap: replicated feature map backed by a Loro document.
//!
//! Features live in a single root `LoroMap` (default `"geojson-features"`),
//! keyed by feature id, each value a plain (non-container) JSON value. Every
//! write is committed immediately so change notifications fire right away.
//!
//! Exchanging the exported bytes with other peers is the transport's job.

use crate::events::Subscription;
use crate::feature::Feature;
use crate::map::{MapChange, MapError, MapObserver, ReplicatedFeatureMap, Result};
use loro::event::{Diff, DiffEvent};
use loro::{ContainerTrait, EventTriggerKind, ExportMode, LoroDoc, LoroMap, VersionVector};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Root container name used when none is configured.
pub const DEFAULT_CONTAINER: &str = "geojson-features";

pub struct LoroFeatureMap {
    doc: LoroDoc,
    features: LoroMap,
}

impl LoroFeatureMap {
    /// Create a map in a fresh document under the default container.
    pub fn new() -> Self {
        Self::with_doc(LoroDoc::new(), DEFAULT_CONTAINER)
    }

    /// Use `container` inside an existing document.
    pub fn with_doc(doc: LoroDoc, container: &str) -> Self {
        let features = doc.get_map(container);
        Self { doc, features }
    }

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| MapError::Loro(e.to_string()))
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| MapError::Loro(e.to_string()))
    }

    /// Import a snapshot or update from another peer.
    ///
    /// Observers see the resulting changes as remote.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        self.doc
            .import(data)
            .map_err(|e| MapError::Loro(e.to_string()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Raw JSON stored under every key.
    fn raw_entries(&self) -> Vec<(String, serde_json::Value)> {
        let value = self.features.get_deep_value();
        let mut entries = Vec::new();
        if let loro::LoroValue::Map(map) = value {
            for (key, value) in map.iter() {
                match loro_value_to_json(value) {
                    Ok(json) => entries.push((key.clone(), json)),
                    Err(()) => warn!("Skipping non-JSON value under key {}", key),
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl Default for LoroFeatureMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedFeatureMap for LoroFeatureMap {
    fn get(&self, id: &str) -> Result<Option<Feature>> {
        let value = self.features.get_deep_value();
        let loro::LoroValue::Map(map) = value else {
            return Ok(None);
        };
        let Some(stored) = map.get(id) else {
            return Ok(None);
        };
        let json = loro_value_to_json(stored).map_err(|()| MapError::Malformed {
            key: id.to_string(),
            source: crate::feature::FeatureError::NotAnObject("a container"),
        })?;
        Feature::from_json(json)
            .map(Some)
            .map_err(|source| MapError::Malformed {
                key: id.to_string(),
                source,
            })
    }

    fn set(&self, id: &str, feature: &Feature) -> Result<()> {
        let json_value = feature.to_json()?;
        self.features
            .insert(id, json_value)
            .map_err(|e| MapError::Loro(e.to_string()))?;
        self.doc.commit();
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        if self.features.get(id).is_none() {
            return Ok(());
        }
        self.features
            .delete(id)
            .map_err(|e| MapError::Loro(e.to_string()))?;
        self.doc.commit();
        Ok(())
    }

    fn keys(&self) -> BTreeSet<String> {
        let value = self.features.get_deep_value();
        match value {
            loro::LoroValue::Map(map) => map.keys().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    fn entries(&self) -> Vec<(String, Feature)> {
        self.raw_entries()
            .into_iter()
            .filter_map(|(key, json)| match Feature::from_json(json) {
                Ok(feature) => Some((key, feature)),
                Err(e) => {
                    warn!("Skipping malformed feature {}: {}", key, e);
                    None
                }
            })
            .collect()
    }

    fn observe(&self, observer: MapObserver) -> Subscription {
        let subscription = self.doc.subscribe(
            &self.features.id(),
            Arc::new(move |event: DiffEvent<'_>| {
                let mut changed_keys = BTreeSet::new();
                for container_diff in &event.events {
                    if let Diff::Map(delta) = &container_diff.diff {
                        changed_keys.extend(delta.updated.keys().map(|k| k.to_string()));
                    }
                }
                if changed_keys.is_empty() {
                    return;
                }

                let change = MapChange {
                    changed_keys,
                    is_local_origin: matches!(event.triggered_by, EventTriggerKind::Local),
                };
                observer(&change);
            }),
        );

        Subscription::new(move || drop(subscription))
    }
}

/// Convert LoroValue to serde_json::Value
fn loro_value_to_json(value: &loro::LoroValue) -> std::result::Result<serde_json::Value, ()> {
    match value {
        loro::LoroValue::Null => Ok(serde_json::Value::Null),
        loro::LoroValue::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        loro::LoroValue::I64(n) => Ok(serde_json::json!(*n)),
        loro::LoroValue::Double(n) => Ok(serde_json::json!(*n)),
        loro::LoroValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        loro::LoroValue::List(arr) => {
            let items: std::result::Result<Vec<_>, _> = arr.iter().map(loro_value_to_json).collect();
            Ok(serde_json::Value::Array(items?))
        }
        loro::LoroValue::Map(map) => {
            let obj: std::result::Result<serde_json::Map<String, serde_json::Value>, _> = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), loro_value_to_json(v)?)))
                .collect();
            Ok(serde_json::Value::Object(obj?))
        }
        // Binary blobs and nested containers are never written by this crate
        _ => Err(()),
    }
}
