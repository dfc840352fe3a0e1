//! Rendezvous registry.
//!
//! A small, authoritative, in-memory store of peer registrations. Each record
//! maps a peer id to its candidate list and registration instant; records
//! older than [`REGISTRATION_TTL`] are invisible to lookups and eventually
//! reclaimed by a background sweeper. Restart loses everything — peers
//! re-register within one TTL window by design.
//!
//! Lookups filter expired records inline, so the sweeper is purely a memory
//! reclamation optimization, never a correctness mechanism.
//!
//! The handle is cheap to clone; all clones share one map. Concurrency is a
//! single reader-writer discipline: lookups take the read half, registration,
//! removal and the sweeper take the write half. No lock is held across an
//! await of anything but the lock itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::candidate::{Candidate, PeerInfo};

/// Maximum age of a registration before it stops being observable.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(30);

/// Interval between sweeper passes that reclaim expired records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A stored registration. The monotonic instant drives expiry; the wall-clock
/// timestamp is what goes over the wire.
#[derive(Clone, Debug)]
struct Record {
    info: PeerInfo,
    registered_at: Instant,
}

impl Record {
    fn is_expired(&self) -> bool {
        self.registered_at.elapsed() > REGISTRATION_TTL
    }
}

/// Handle to the rendezvous registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    peers: Arc<RwLock<HashMap<String, Record>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an active registry and spawn its sweeper task.
    pub fn new() -> Self {
        let peers: Arc<RwLock<HashMap<String, Record>>> = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let sweeper_peers = peers.clone();
        let sweeper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.cancelled() => {
                        debug!("registry sweeper stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        let mut map = sweeper_peers.write().await;
                        let before = map.len();
                        map.retain(|_, record| !record.is_expired());
                        let removed = before - map.len();
                        if removed > 0 {
                            debug!(removed, "swept expired registrations");
                        }
                    }
                }
            }
        });

        Self { peers, shutdown }
    }

    /// Upsert a registration. A colliding id atomically replaces the earlier
    /// record — the candidate list observed afterwards is exactly the
    /// submitted one, never a merge. An empty candidate list is accepted.
    pub async fn register(&self, peer_id: impl Into<String>, candidates: Vec<Candidate>) {
        let peer_id = peer_id.into();
        let record = Record {
            info: PeerInfo {
                id: peer_id.clone(),
                candidates,
                timestamp: Utc::now(),
            },
            registered_at: Instant::now(),
        };

        let mut map = self.peers.write().await;
        let replaced = map.insert(peer_id.clone(), record).is_some();
        info!(
            peer = %peer_id,
            replaced,
            "peer registered"
        );
    }

    /// Look up a peer. Absent and expired records are both `None`.
    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        let map = self.peers.read().await;
        map.get(peer_id)
            .filter(|record| !record.is_expired())
            .map(|record| record.info.clone())
    }

    /// All non-expired registrations, in unspecified order.
    pub async fn list(&self) -> Vec<PeerInfo> {
        let map = self.peers.read().await;
        map.values()
            .filter(|record| !record.is_expired())
            .map(|record| record.info.clone())
            .collect()
    }

    /// Remove a registration. Removing an absent id is a no-op.
    pub async fn remove(&self, peer_id: &str) {
        let mut map = self.peers.write().await;
        if map.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "peer removed");
        }
    }

    /// Number of non-expired registrations.
    pub async fn count(&self) -> usize {
        let map = self.peers.read().await;
        map.values().filter(|record| !record.is_expired()).count()
    }

    /// Stop the sweeper. Idempotent; a second close is a no-op.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
