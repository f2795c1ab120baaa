/// Peer Table Module
///
/// Tracks peers seen on the LAN and the persisted trust records gating them.
/// The table is a lock-guarded map; readers copy on iterate, and a sweep
/// task evicts peers whose beacons have gone quiet.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

use crate::conflict::AutoResolvePolicy;
use crate::crypto;
use crate::schedule::now_ms;

/// Stable 128-bit peer identifier.
pub type PeerId = Uuid;

/// Liveness TTL: a peer is online iff its last beacon is younger than this.
pub const LIVENESS_TTL_MS: i64 = 10_000;

/// A peer as currently known from discovery. At most one live connection
/// exists per peer ID; the transport holds the socket, the peer record only
/// carries the ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub address: IpAddr,
    pub transfer_port: u16,
    /// Raw 32-byte Ed25519 identity public key.
    pub identity_public_key: Vec<u8>,
    pub last_seen_ms: i64,
    pub sync_enabled: bool,
}

impl Peer {
    pub fn is_online_at(&self, now_ms: i64) -> bool {
        now_ms - self.last_seen_ms < LIVENESS_TTL_MS
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.identity_public_key)
    }
}

/// Persisted trust record. Trust binds to the identity key fingerprint, so a
/// re-keyed peer must be trusted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub peer_id: PeerId,
    pub fingerprint: String,
    pub display_name: String,
    pub trusted_at: DateTime<Utc>,
    /// Optional automatic conflict policy for this peer.
    #[serde(default)]
    pub auto_resolve: Option<AutoResolvePolicy>,
}

/// Lock-guarded map of discovered peers.
pub struct PeerTable {
    peers: Mutex<HashMap<PeerId, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self { peers: Mutex::new(HashMap::new()) }
    }

    /// Insert or refresh from a beacon. Returns true when the peer was not
    /// previously known (or had been evicted).
    pub fn upsert(&self, peer: Peer) -> bool {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(peer.id, peer).is_none()
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        self.peers.lock().unwrap().remove(id)
    }

    /// Copy-on-iterate view of all known peers.
    pub fn list(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    /// Peers currently considered online.
    pub fn online(&self) -> Vec<Peer> {
        let now = now_ms();
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.is_online_at(now))
            .cloned()
            .collect()
    }

    /// Remove peers whose TTL has lapsed and return them so the caller can
    /// emit `PeerLost`.
    pub fn sweep_expired(&self) -> Vec<Peer> {
        let now = now_ms();
        let mut peers = self.peers.lock().unwrap();
        let expired: Vec<PeerId> = peers
            .values()
            .filter(|p| !p.is_online_at(now))
            .map(|p| p.id)
            .collect();
        expired.iter().filter_map(|id| peers.remove(id)).collect()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
