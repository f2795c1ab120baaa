/// Peer Discovery Module
///
/// UDP broadcast beacons announce this device every 3 seconds (and
/// immediately when the advertised state changes). Incoming beacons feed the
/// peer table; a 2-second sweep evicts peers whose beacons stop arriving for
/// 10 seconds. Peers whose identity key has no trust record stay visible but
/// flagged untrusted; the transport refuses sync frames from them until the
/// pairing collaborator establishes trust.
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventBus, SyncEvent};
use crate::peer::{Peer, PeerTable};
use crate::schedule::now_ms;

/// Beacon emission period.
const BEACON_INTERVAL: Duration = Duration::from_secs(3);

/// Liveness sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Cap for the bind-failure retry backoff.
const MAX_BIND_BACKOFF: Duration = Duration::from_secs(30);

/// Wire form of one discovery beacon (JSON datagram).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub peer_id: Uuid,
    pub peer_name: String,
    pub transfer_port: u16,
    /// Hex-encoded 32-byte identity public key.
    pub identity_public_key: String,
    pub sync_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("beacon serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// What the emitter currently advertises. Refreshed before every send so
/// sync-enabled toggles and manifest changes go out on the next beacon.
pub trait BeaconSource: Send + Sync {
    fn current_beacon(&self) -> Beacon;
}

/// Handle to the running discovery tasks.
pub struct DiscoveryHandle {
    announce: mpsc::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Request an immediate beacon, e.g. after a sync-enabled toggle or a
    /// port change.
    pub fn announce_now(&self) {
        let _ = self.announce.try_send(());
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Discovery service: beacon emitter, beacon receiver, liveness sweeper.
pub struct Discovery {
    pub local_id: Uuid,
    pub port: u16,
    pub source: Arc<dyn BeaconSource>,
    pub peer_table: Arc<PeerTable>,
    pub config: Arc<RwLock<Config>>,
    pub events: EventBus,
}

impl Discovery {
    /// Spawn the three background tasks. All of them exit when `shutdown`
    /// flips to true.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> DiscoveryHandle {
        let (announce_tx, announce_rx) = mpsc::channel(4);

        let emitter = tokio::spawn(emitter_loop(
            self.port,
            self.source.clone(),
            announce_rx,
            shutdown.clone(),
        ));
        let receiver = tokio::spawn(receiver_loop(
            self.port,
            self.local_id,
            self.peer_table.clone(),
            self.config.clone(),
            self.events.clone(),
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(sweeper_loop(
            self.peer_table.clone(),
            self.events.clone(),
            shutdown,
        ));

        DiscoveryHandle { announce: announce_tx, tasks: vec![emitter, receiver, sweeper] }
    }
}

async fn emitter_loop(
    port: u16,
    source: Arc<dyn BeaconSource>,
    mut announce: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(target: "swarm::discovery", "cannot open beacon send socket: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tracing::error!(target: "swarm::discovery", "cannot enable broadcast: {}", e);
        return;
    }
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, port));

    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = announce.recv() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        let beacon = source.current_beacon();
        if let Err(e) = socket.send_to(&beacon.encode(), target).await {
            tracing::warn!(target: "swarm::discovery", "beacon send failed: {}", e);
        }
    }
}

async fn receiver_loop(
    port: u16,
    local_id: Uuid,
    peer_table: Arc<PeerTable>,
    config: Arc<RwLock<Config>>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    let socket = loop {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(s) => break s,
            Err(e) => {
                tracing::warn!(
                    target: "swarm::discovery",
                    "cannot bind beacon port {}: {}; retrying in {:?}",
                    port, e, backoff
                );
                events.emit(SyncEvent::BindingFailed { port, reason: e.to_string() });
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                backoff = (backoff * 2).min(MAX_BIND_BACKOFF);
            }
        }
    };

    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        if let Some(beacon) = Beacon::decode(&buf[..len]) {
                            handle_beacon(beacon, src.ip(), &peer_table, &config, &events, local_id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "swarm::discovery", "beacon receive failed: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Apply one received beacon to the peer table, emitting discovery events
/// for peers not previously known.
pub fn handle_beacon(
    beacon: Beacon,
    source_ip: IpAddr,
    peer_table: &PeerTable,
    config: &RwLock<Config>,
    events: &EventBus,
    local_id: Uuid,
) {
    if beacon.peer_id == local_id {
        return;
    }
    let identity_public_key = match hex::decode(&beacon.identity_public_key) {
        Ok(bytes) if bytes.len() == 32 => bytes,
        _ => {
            tracing::debug!(target: "swarm::discovery", "beacon from {} has a malformed identity key", source_ip);
            return;
        }
    };

    let peer = Peer {
        id: beacon.peer_id,
        name: beacon.peer_name,
        address: source_ip,
        transfer_port: beacon.transfer_port,
        identity_public_key,
        last_seen_ms: now_ms(),
        sync_enabled: beacon.sync_enabled,
    };
    let fingerprint = peer.fingerprint();
    let is_new = peer_table.upsert(peer.clone());
    if is_new {
        let trusted = config.read().unwrap().is_trusted(&fingerprint);
        tracing::info!(
            target: "swarm::discovery",
            "discovered peer {} ({}) at {}:{} [{}]",
            peer.name, peer.id, peer.address, peer.transfer_port,
            if trusted { "trusted" } else { "untrusted" }
        );
        if trusted {
            events.emit(SyncEvent::PeerDiscovered(peer));
        } else {
            events.emit(SyncEvent::UntrustedPeerDiscovered(peer));
        }
    }
}

async fn sweeper_loop(
    peer_table: Arc<PeerTable>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        for peer in peer_table.sweep_expired() {
            tracing::info!(target: "swarm::discovery", "peer {} ({}) went offline", peer.name, peer.id);
            events.emit(SyncEvent::PeerLost(peer.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeypair;

    fn beacon(id: Uuid, identity: &IdentityKeypair) -> Beacon {
        Beacon {
            peer_id: id,
            peer_name: "desk".to_string(),
            transfer_port: 52001,
            identity_public_key: hex::encode(identity.public_bytes()),
            sync_enabled: true,
            manifest_hash: None,
        }
    }

    #[test]
    fn beacon_json_roundtrip() {
        let identity = IdentityKeypair::generate();
        let b = beacon(Uuid::new_v4(), &identity);
        let decoded = Beacon::decode(&b.encode()).unwrap();
        assert_eq!(decoded, b);
        assert!(Beacon::decode(b"not json").is_none());
    }

    #[test]
    fn own_beacon_is_ignored() {
        let identity = IdentityKeypair::generate();
        let local_id = Uuid::new_v4();
        let table = PeerTable::new();
        let config = RwLock::new(Config::default());
        let events = EventBus::new();

        handle_beacon(
            beacon(local_id, &identity),
            "192.168.1.5".parse().unwrap(),
            &table,
            &config,
            &events,
            local_id,
        );
        assert!(table.list().is_empty());
    }

    #[tokio::test]
    async fn trust_gate_splits_discovery_events() {
        let identity = IdentityKeypair::generate();
        let peer_id = Uuid::new_v4();
        let table = PeerTable::new();
        let events = EventBus::new();
        let mut rx = events.subscribe();

        // Untrusted first
        let config = RwLock::new(Config::default());
        handle_beacon(
            beacon(peer_id, &identity),
            "192.168.1.7".parse().unwrap(),
            &table,
            &config,
            &events,
            Uuid::new_v4(),
        );
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::UntrustedPeerDiscovered(_)));

        // Trusted after a trust record appears
        table.remove(&peer_id);
        config.write().unwrap().trust_peer(crate::peer::TrustedPeer {
            peer_id,
            fingerprint: identity.fingerprint(),
            display_name: "desk".to_string(),
            trusted_at: chrono::Utc::now(),
            auto_resolve: None,
        });
        handle_beacon(
            beacon(peer_id, &identity),
            "192.168.1.7".parse().unwrap(),
            &table,
            &config,
            &events,
            Uuid::new_v4(),
        );
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::PeerDiscovered(_)));
    }

    #[test]
    fn repeat_beacons_refresh_last_seen_silently() {
        let identity = IdentityKeypair::generate();
        let peer_id = Uuid::new_v4();
        let table = PeerTable::new();
        let config = RwLock::new(Config::default());
        let events = EventBus::new();

        for _ in 0..3 {
            handle_beacon(
                beacon(peer_id, &identity),
                "192.168.1.9".parse().unwrap(),
                &table,
                &config,
                &events,
                Uuid::new_v4(),
            );
        }
        assert_eq!(table.list().len(), 1);
    }
}
