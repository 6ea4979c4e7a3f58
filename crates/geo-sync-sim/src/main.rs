//! geo-sync-sim: Runs several drawing peers in one room and checks that they
//! converge.
//!
//! Every peer is an in-memory drawing store bridged to its own Loro document.
//! Room messages are relayed in process, in batches, so concurrent edits to
//! the same feature happen regularly.

use anyhow::{bail, Result};
use clap::Parser;
use loro::VersionVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use geo_sync::{
    BridgeEvent, CollabSession, Feature, InMemoryFeatureStore, LocalFeatureStore,
    ReplicatedFeatureMap, RoomName, SessionConfig, Subscription,
};

#[derive(Parser, Debug)]
#[command(name = "geo-sync-sim")]
#[command(about = "Simulate peers drawing on a shared map")]
struct Args {
    /// Number of peers in the room
    #[arg(short, long, default_value_t = 3)]
    peers: usize,

    /// Number of drawing operations to perform
    #[arg(short, long, default_value_t = 50)]
    features: usize,

    /// Operations performed between two relay rounds
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Add a peer with offline drafts after the others have drawn
    #[arg(long)]
    late_joiner: bool,

    /// Room name (generated if not provided)
    #[arg(long)]
    room: Option<String>,

    /// Seed for the operation generator (random if not provided)
    #[arg(long)]
    seed: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

struct SimPeer {
    name: String,
    session: CollabSession,
    store: Arc<InMemoryFeatureStore>,
    _monitor: Subscription,
}

impl SimPeer {
    fn join(name: String, room: &RoomName, peer_id: u64, drafts: Vec<Feature>) -> Result<Self> {
        let config = SessionConfig {
            room: room.clone(),
            peer_id: Some(peer_id),
            ..SessionConfig::default()
        };
        let mut session = CollabSession::start(config)?;

        let store = Arc::new(InMemoryFeatureStore::new());
        for draft in drafts {
            store.import_feature(draft)?;
        }

        let label = name.clone();
        let bridge = session.attach(store.clone(), store.events());
        let monitor = bridge.subscribe(move |event| match event {
            BridgeEvent::Reconciled {
                imported, removed, ..
            } => info!("{}: reconciled ({} imported, {} removed)", label, imported, removed),
            BridgeEvent::RemoteBatchApplied {
                imported, removed, ..
            } => debug!("{}: applied remote batch (+{} -{})", label, imported, removed),
            _ => {}
        });

        Ok(Self {
            name,
            session,
            store,
            _monitor: monitor,
        })
    }

    fn version(&self) -> VersionVector {
        self.session.version()
    }

    /// Send `other` whatever it is missing from us. Returns false if nothing was sent.
    fn push_to(&self, other: &SimPeer) -> Result<bool> {
        let theirs = other.version();
        if theirs.includes_vv(&self.version()) {
            return Ok(false);
        }
        let message = self.session.update_message(&theirs)?;
        other.session.receive(&message)?;
        Ok(true)
    }
}

/// Relay between every pair until no peer has anything new to send.
fn relay(peers: &[SimPeer]) -> Result<usize> {
    let mut messages = 0;
    loop {
        let mut sent = false;
        for from in peers {
            for to in peers {
                if from.name != to.name && from.push_to(to)? {
                    messages += 1;
                    sent = true;
                }
            }
        }
        if !sent {
            return Ok(messages);
        }
    }
}

fn random_polygon(rng: &mut StdRng) -> serde_json::Value {
    let x: f64 = rng.random_range(-180.0..170.0);
    let y: f64 = rng.random_range(-80.0..70.0);
    let size: f64 = rng.random_range(0.5..10.0);
    json!({
        "type": "Polygon",
        "coordinates": [[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]]
    })
}

fn random_point(rng: &mut StdRng) -> serde_json::Value {
    json!({
        "type": "Point",
        "coordinates": [rng.random_range(-180.0..180.0), rng.random_range(-90.0..90.0)]
    })
}

/// Perform one random drawing operation on `peer`.
fn step(peer: &SimPeer, rng: &mut StdRng, op: usize) {
    let ids = peer.store.ids();
    let target = (!ids.is_empty()).then(|| ids[rng.random_range(0..ids.len())].clone());

    let Some(id) = target.filter(|_| rng.random_bool(0.6)) else {
        let feature = Feature::new(random_polygon(rng))
            .with_property("name", json!(format!("{}-{}", peer.name, op)));
        let id = peer.store.draw(feature);
        debug!("{}: draw {}", peer.name, id);
        return;
    };

    match rng.random_range(0..5) {
        0 => {
            peer.store.edit(&id, random_polygon(rng));
            debug!("{}: edit {}", peer.name, id);
        }
        1 => {
            peer.store.drag(&id, random_polygon(rng));
            debug!("{}: drag {}", peer.name, id);
        }
        2 => {
            peer.store.rotate(&id, random_polygon(rng));
            debug!("{}: rotate {}", peer.name, id);
        }
        3 => {
            let pieces = peer
                .store
                .cut(&id, vec![random_polygon(rng), random_point(rng)]);
            debug!("{}: cut {} into {:?}", peer.name, id, pieces);
        }
        _ => {
            peer.store.erase(&id);
            debug!("{}: erase {}", peer.name, id);
        }
    }
}

/// Compare every peer against the first one.
fn check_convergence(peers: &[SimPeer]) -> bool {
    let Some((reference, rest)) = peers.split_first() else {
        return true;
    };
    let expected_store = reference.store.snapshot();
    let expected_map = reference.session.map().entries();

    let mut converged = true;
    for peer in rest {
        if peer.store.snapshot() != expected_store {
            warn!(
                "{}: store differs from {} ({} vs {} features)",
                peer.name,
                reference.name,
                peer.store.len(),
                expected_store.len()
            );
            converged = false;
        }
        if peer.session.map().entries() != expected_map {
            warn!("{}: map differs from {}", peer.name, reference.name);
            converged = false;
        }
    }
    for peer in peers {
        let map_ids: Vec<String> = peer.session.map().keys().into_iter().collect();
        if map_ids != peer.store.ids() {
            warn!("{}: store and map hold different ids", peer.name);
            converged = false;
        }
    }
    converged
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,geo_sync=debug"
    } else {
        "info,geo_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.peers == 0 {
        bail!("--peers must be at least 1");
    }

    let room = match &args.room {
        Some(name) => RoomName::new(name.as_str())?,
        None => RoomName::generate(),
    };
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    info!("Room {} with {} peer(s), seed {}", room, args.peers, seed);

    let mut peers = Vec::with_capacity(args.peers + 1);
    for i in 0..args.peers {
        let peer = SimPeer::join(format!("peer-{}", i), &room, i as u64 + 1, Vec::new())?;
        peer.store.finish_loading();
        peers.push(peer);
    }

    let mut messages = 0;
    let batch = args.batch.max(1);
    for op in 0..args.features {
        let peer = &peers[rng.random_range(0..peers.len())];
        step(peer, &mut rng, op);
        if (op + 1) % batch == 0 {
            messages += relay(&peers)?;
        }
    }
    messages += relay(&peers)?;

    if args.late_joiner {
        let drafts = vec![
            Feature::new(random_polygon(&mut rng)).with_id("offline-draft"),
            Feature::new(random_point(&mut rng)),
        ];
        let late = SimPeer::join("late-joiner".to_string(), &room, args.peers as u64 + 1, drafts)?;
        late.session.receive(&peers[0].session.snapshot_message()?)?;
        late.store.finish_loading();
        info!(
            "late-joiner: {} feature(s) after reconciliation",
            late.store.len()
        );
        peers.push(late);
        messages += relay(&peers)?;
    }

    let converged = check_convergence(&peers);
    info!(
        "{} operation(s), {} message(s), {} feature(s) on {}",
        args.features,
        messages,
        peers[0].store.len(),
        peers[0].name
    );

    if !converged {
        bail!("peers did not converge (seed {})", seed);
    }
    info!("All {} peer(s) converged", peers.len());
    Ok(())
}
