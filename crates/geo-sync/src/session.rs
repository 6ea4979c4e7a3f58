//! Collaboration sessions: one room, one replicated document, one bridge.
//!
//! A `CollabSession` owns the Loro document for a room and the bridge that
//! connects it to the drawing tool. Moving bytes between peers is left to the
//! caller; the session only produces and consumes `RoomMessage` envelopes.
//!
//! ```text
//! peer A: snapshot_message() ──bytes──> peer B: receive()
//! peer A: update_message(&since) ──bytes──> peer B: receive()
//! ```

use crate::bridge::FeatureSyncBridge;
use crate::events::EventBus;
use crate::loro_map::{LoroFeatureMap, DEFAULT_CONTAINER};
use crate::map::MapError;
use crate::store::{DrawEvent, LocalFeatureStore};

use loro::{LoroDoc, VersionVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const ROOM_PREFIX: &str = "war-map-";
const ROOM_SUFFIX_LEN: usize = 7;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomNameError {
    #[error("Room name is empty")]
    Empty,
    #[error("Room name contains whitespace: {0:?}")]
    Whitespace(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid room name: {0}")]
    Room(#[from] RoomNameError),

    #[error("Invalid peer id {0:?}: expected an unsigned integer")]
    InvalidPeerId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Message for room {received} delivered to room {expected}")]
    WrongRoom { expected: String, received: String },

    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Map error: {0}")]
    Map(#[from] MapError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Identifier shared by every peer editing the same map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, RoomNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RoomNameError::Empty);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(RoomNameError::Whitespace(name));
        }
        Ok(Self(name))
    }

    /// Generate a fresh room name such as `war-map-k3x9q0a`.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..ROOM_SUFFIX_LEN)
            .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
            .collect();
        Self(format!("{}{}", ROOM_PREFIX, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = RoomNameError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

/// Session settings. Every field has a default, so an empty config is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "RoomName::generate")]
    pub room: RoomName,
    /// Root map container holding the features.
    #[serde(default = "default_container")]
    pub container: String,
    /// Fixed Loro peer id. Random when unset.
    #[serde(default)]
    pub peer_id: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: RoomName::generate(),
            container: default_container(),
            peer_id: None,
        }
    }
}

impl SessionConfig {
    pub fn new(room: RoomName) -> Self {
        Self {
            room,
            ..Self::default()
        }
    }

    /// Build a config from `GEO_SYNC_ROOM`, `GEO_SYNC_CONTAINER` and
    /// `GEO_SYNC_PEER_ID`, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(room) = lookup("GEO_SYNC_ROOM") {
            config.room = RoomName::new(room)?;
        }
        if let Some(container) = lookup("GEO_SYNC_CONTAINER").filter(|c| !c.is_empty()) {
            config.container = container;
        }
        if let Some(peer_id) = lookup("GEO_SYNC_PEER_ID") {
            let parsed = peer_id
                .trim()
                .parse::<u64>()
                .map_err(|_| SessionError::InvalidPeerId(peer_id.clone()))?;
            config.peer_id = Some(parsed);
        }
        Ok(config)
    }
}

/// Envelope for document bytes exchanged between peers of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Full document state, sent to late joiners
    Snapshot { room: String, data: Vec<u8> },
    /// Changes since a version the receiver already has
    Update { room: String, data: Vec<u8> },
}

impl RoomMessage {
    pub fn room(&self) -> &str {
        match self {
            RoomMessage::Snapshot { room, .. } | RoomMessage::Update { room, .. } => room,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            RoomMessage::Snapshot { data, .. } | RoomMessage::Update { data, .. } => data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SessionError::Deserialization(e.to_string()))
    }
}

/// A peer's participation in one room.
pub struct CollabSession {
    config: SessionConfig,
    map: Arc<LoroFeatureMap>,
    bridge: Option<FeatureSyncBridge>,
}

impl CollabSession {
    /// Create the replicated document for `config.room`. No bridge is attached yet.
    pub fn start(config: SessionConfig) -> Result<Self> {
        let doc = LoroDoc::new();
        if let Some(peer_id) = config.peer_id {
            doc.set_peer_id(peer_id)
                .map_err(|e| SessionError::Loro(e.to_string()))?;
        }
        let map = Arc::new(LoroFeatureMap::with_doc(doc, &config.container));
        info!(
            "Session started in room {} (peer {}, container {})",
            config.room,
            map.peer_id(),
            config.container
        );
        Ok(Self {
            config,
            map,
            bridge: None,
        })
    }

    pub fn room(&self) -> &RoomName {
        &self.config.room
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn map(&self) -> &Arc<LoroFeatureMap> {
        &self.map
    }

    pub fn bridge(&self) -> Option<&FeatureSyncBridge> {
        self.bridge.as_ref()
    }

    /// Connect a drawing tool. Any previously attached bridge is destroyed first.
    pub fn attach(
        &mut self,
        store: Arc<dyn LocalFeatureStore>,
        events: &Arc<EventBus<DrawEvent>>,
    ) -> &FeatureSyncBridge {
        if let Some(previous) = self.bridge.take() {
            debug!("Replacing bridge in room {}", self.config.room);
            previous.destroy();
        }
        self.bridge
            .insert(FeatureSyncBridge::setup(store, events, self.map.clone()))
    }

    /// Tear down the bridge. The document stays available for export.
    pub fn end(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.destroy();
            info!("Session ended in room {}", self.config.room);
        }
    }

    pub fn version(&self) -> VersionVector {
        self.map.version()
    }

    /// Full document state for a peer that has nothing yet.
    pub fn snapshot_message(&self) -> Result<Vec<u8>> {
        RoomMessage::Snapshot {
            room: self.config.room.to_string(),
            data: self.map.export_snapshot()?,
        }
        .encode()
    }

    /// Changes made since `since`.
    pub fn update_message(&self, since: &VersionVector) -> Result<Vec<u8>> {
        RoomMessage::Update {
            room: self.config.room.to_string(),
            data: self.map.export_updates(since)?,
        }
        .encode()
    }

    /// Apply a message from another peer. Change notifications (and with them
    /// the bridge) run before this returns.
    pub fn receive(&self, bytes: &[u8]) -> Result<()> {
        let message = RoomMessage::decode(bytes)?;
        if message.room() != self.config.room.as_str() {
            return Err(SessionError::WrongRoom {
                expected: self.config.room.to_string(),
                received: message.room().to_string(),
            });
        }
        debug!(
            "Importing {} bytes into room {}",
            message.data().len(),
            self.config.room
        );
        self.map.import(message.data())?;
        Ok(())
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabSession")
            .field("room", &self.config.room)
            .field("peer_id", &self.map.peer_id())
            .field("bridge", &self.bridge)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Lifecycle;
    use crate::feature::Feature;
    use crate::map::ReplicatedFeatureMap;
    use crate::store::InMemoryFeatureStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn point(x: f64) -> serde_json::Value {
        json!({ "type": "Point", "coordinates": [x, x] })
    }

    fn room(name: &str) -> RoomName {
        RoomName::new(name).unwrap()
    }

    #[test]
    fn test_room_name_validation() {
        assert_eq!(RoomName::new(""), Err(RoomNameError::Empty));
        assert!(matches!(
            RoomName::new("war map"),
            Err(RoomNameError::Whitespace(_))
        ));
        assert_eq!(room("war-map-abc1234").as_str(), "war-map-abc1234");
    }

    #[test]
    fn test_generated_room_name() {
        let name = RoomName::generate();
        let suffix = name.as_str().strip_prefix("war-map-").unwrap();
        assert_eq!(suffix.len(), 7);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
        assert!(RoomName::new(name.as_str()).is_ok());
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.room.as_str().starts_with("war-map-"));
        assert_eq!(config.container, DEFAULT_CONTAINER);
        assert_eq!(config.peer_id, None);

        let bad: std::result::Result<SessionConfig, _> =
            serde_json::from_str(r#"{ "room": "has space" }"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GEO_SYNC_ROOM", "ops-room"),
            ("GEO_SYNC_CONTAINER", "layers"),
            ("GEO_SYNC_PEER_ID", "42"),
        ]);
        let config = SessionConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.room, room("ops-room"));
        assert_eq!(config.container, "layers");
        assert_eq!(config.peer_id, Some(42));

        let invalid = SessionConfig::from_lookup(|k| {
            (k == "GEO_SYNC_PEER_ID").then(|| "not-a-number".to_string())
        });
        assert!(matches!(invalid, Err(SessionError::InvalidPeerId(_))));
    }

    #[test]
    fn test_start_uses_configured_peer_and_container() {
        let config = SessionConfig {
            room: room("r"),
            container: "layers".to_string(),
            peer_id: Some(7),
        };
        let session = CollabSession::start(config).unwrap();
        assert_eq!(session.map().peer_id(), 7);

        session
            .map()
            .set("a", &Feature::new(point(1.0)).with_id("a"))
            .unwrap();
        assert_eq!(session.map().doc().get_map("layers").len(), 1);
        assert!(session.bridge().is_none());
    }

    #[test]
    fn test_message_roundtrip_between_sessions() {
        let a = CollabSession::start(SessionConfig::new(room("shared"))).unwrap();
        let b = CollabSession::start(SessionConfig::new(room("shared"))).unwrap();

        a.map()
            .set("a", &Feature::new(point(1.0)).with_id("a"))
            .unwrap();
        b.receive(&a.snapshot_message().unwrap()).unwrap();
        assert!(b.map().keys().contains("a"));

        let since = a.version();
        a.map().delete("a").unwrap();
        b.receive(&a.update_message(&since).unwrap()).unwrap();
        assert!(b.map().is_empty());
    }

    #[test]
    fn test_receive_rejects_other_room() {
        let a = CollabSession::start(SessionConfig::new(room("one"))).unwrap();
        let b = CollabSession::start(SessionConfig::new(room("two"))).unwrap();

        let result = b.receive(&a.snapshot_message().unwrap());
        assert!(matches!(result, Err(SessionError::WrongRoom { .. })));
    }

    #[test]
    fn test_receive_rejects_garbage() {
        let a = CollabSession::start(SessionConfig::new(room("one"))).unwrap();
        assert!(matches!(
            a.receive(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(SessionError::Deserialization(_))
        ));
    }

    #[test]
    fn test_attach_replaces_and_end_destroys() {
        let mut session = CollabSession::start(SessionConfig::new(room("r"))).unwrap();
        let first = Arc::new(InMemoryFeatureStore::new());
        let second = Arc::new(InMemoryFeatureStore::new());

        session.attach(first.clone(), first.events());
        assert_eq!(first.events().subscriber_count(), 1);

        let bridge = session.attach(second.clone(), second.events());
        assert_eq!(bridge.lifecycle(), Lifecycle::Active);
        assert_eq!(first.events().subscriber_count(), 0);

        session.end();
        assert!(session.bridge().is_none());
        assert_eq!(second.events().subscriber_count(), 0);
    }
}
