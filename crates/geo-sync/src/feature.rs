//! GeoJSON features: the unit of synchronization.
//!
//! A feature is an immutable payload. An "update" replaces the whole value
//! stored under an id, never patches it. Geometry is carried as opaque JSON
//! and is not validated here; the receiving store decides what it accepts.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Feature payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Invalid feature: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, FeatureError>;

/// The GeoJSON `type` member. Only `"Feature"` is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    #[default]
    Feature,
}

/// A single GeoJSON feature.
///
/// Foreign members (anything besides `type`, `id`, `geometry` and
/// `properties`, e.g. `bbox`) are kept verbatim so a payload survives a trip
/// through either store unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    kind: FeatureKind,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id"
    )]
    id: Option<String>,

    #[serde(default)]
    geometry: Value,

    #[serde(default)]
    properties: Option<Map<String, Value>>,

    #[serde(flatten)]
    foreign: Map<String, Value>,
}

impl Feature {
    /// Create a feature without an id or properties.
    pub fn new(geometry: Value) -> Self {
        Self {
            kind: FeatureKind::Feature,
            id: None,
            geometry,
            properties: None,
            foreign: Map::new(),
        }
    }

    /// Parse a feature from a GeoJSON value.
    pub fn from_json(value: Value) -> Result<Self> {
        let kind = match &value {
            Value::Object(_) => None,
            Value::Null => Some("null"),
            Value::Bool(_) => Some("a boolean"),
            Value::Number(_) => Some("a number"),
            Value::String(_) => Some("a string"),
            Value::Array(_) => Some("an array"),
        };
        if let Some(kind) = kind {
            return Err(FeatureError::NotAnObject(kind));
        }

        serde_json::from_value(value).map_err(|e| FeatureError::Invalid(e.to_string()))
    }

    /// Serialize to a GeoJSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| FeatureError::Invalid(e.to_string()))
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Set the id. Empty ids are treated as absent.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.id = if id.is_empty() { None } else { Some(id) };
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(id);
        self
    }

    /// Return the id, assigning a fresh UUID first if the feature has none.
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(|| Uuid::new_v4().to_string())
    }

    pub fn geometry(&self) -> &Value {
        &self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Value) {
        self.geometry = geometry;
    }

    pub fn properties(&self) -> Option<&Map<String, Value>> {
        self.properties.as_ref()
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|p| p.get(key))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Foreign members such as `bbox`.
    pub fn foreign_members(&self) -> &Map<String, Value> {
        &self.foreign
    }
}

/// Normalize a GeoJSON id value to the string key used by both stores.
///
/// Strings are kept as-is and numbers use their canonical decimal form.
/// Empty strings, `null` and any other JSON type mean "no id".
pub fn normalize_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(normalize_id))
}
