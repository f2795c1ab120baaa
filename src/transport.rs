/// Wire Transport Module
///
/// Owns every TCP socket in the daemon. A session is established by the
/// plaintext Handshake/HandshakeAck exchange (identity-signed, 10 s budget),
/// after which both directions run AES-256-GCM sealed frames keyed by the
/// X25519-derived session key. Nonces are `direction byte ‖ 88-bit counter`
/// and must be strictly increasing per direction; any replay or reordering
/// tears the session down.
///
/// Each connection is owned by exactly one reader task and one writer task.
/// Inbound frames flow into a bounded queue shared with the sync engine, so
/// a slow engine pauses reads and lets TCP flow control push back on the
/// sender. The writer keeps the link alive with a sealed Ping every 30 s and
/// closes connections idle for more than 60 s.
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{self, IdentityKeypair, SessionExchange, SessionKey};
use crate::error::{SyncError, SyncResult};
use crate::peer::Peer;
use crate::protocol::{
    decode_payload, encode_payload, frame_aad, nonce_counter, session_nonce, Frame, FrameCodec,
    FrameKind, HandshakeRecord,
};
use crate::schedule::now_ms;

/// Handshake must complete within this budget.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connections idle longer than this are closed.
const IDLE_CLOSE: Duration = Duration::from_secs(60);

/// A read blocked longer than this (spanning two missed pings) drops the
/// connection.
const READ_DEADLINE: Duration = Duration::from_secs(90);

/// Bound of the shared inbound frame queue.
pub const INBOUND_QUEUE_FRAMES: usize = 64;

/// What the transport reports to the sync engine.
#[derive(Debug)]
pub enum TransportEvent {
    SessionEstablished { peer_id: Uuid, peer_name: String },
    Frame { peer_id: Uuid, kind: FrameKind, payload: Vec<u8> },
    PeerDisconnected { peer_id: Uuid },
}

/// Sealing half of a session cipher. Lives in the writer task; the counter
/// increments once per frame, so send order equals nonce order.
struct SendCipher {
    key: SessionKey,
    direction: u8,
    counter: u128,
}

impl SendCipher {
    fn seal(&mut self, kind: FrameKind, plaintext: &[u8]) -> SyncResult<Frame> {
        self.counter += 1;
        let nonce = session_nonce(self.direction, self.counter);
        let sealed_len = crypto::NONCE_LEN + plaintext.len() + crypto::TAG_LEN;
        let aad = frame_aad(kind, (1 + sealed_len) as u32);
        let payload = crypto::seal_chunk_with_nonce(self.key.as_bytes(), &nonce, plaintext, &aad)?;
        Ok(Frame::new(kind, payload))
    }
}

/// Opening half of a session cipher. Lives in the reader task and rejects
/// any nonce that does not advance the counter.
struct RecvCipher {
    key: SessionKey,
    expect_direction: u8,
    last_counter: u128,
}

impl RecvCipher {
    fn open(&mut self, frame: &Frame) -> SyncResult<Vec<u8>> {
        if frame.payload.len() < crypto::NONCE_LEN + crypto::TAG_LEN {
            return Err(SyncError::Protocol("sealed frame too short".to_string()));
        }
        let nonce: [u8; crypto::NONCE_LEN] = frame.payload[..crypto::NONCE_LEN]
            .try_into()
            .map_err(|_| SyncError::Protocol("sealed frame too short".to_string()))?;
        if nonce[0] != self.expect_direction {
            return Err(SyncError::Protocol("bad nonce direction".to_string()));
        }
        let counter = nonce_counter(&nonce);
        if counter <= self.last_counter {
            return Err(SyncError::Protocol(format!(
                "replayed or out-of-order nonce {} (last {})",
                counter, self.last_counter
            )));
        }
        let aad = frame_aad(frame.kind, (1 + frame.payload.len()) as u32);
        let plaintext = crypto::open_chunk(self.key.as_bytes(), &frame.payload, &aad)?;
        self.last_counter = counter;
        Ok(plaintext)
    }
}

/// Sender handle for one established session.
#[derive(Clone)]
pub struct SessionHandle {
    pub peer_id: Uuid,
    pub peer_name: String,
    tx: mpsc::Sender<(FrameKind, Vec<u8>)>,
}

impl SessionHandle {
    /// Queue a plaintext payload for sealing and transmission.
    pub async fn send(&self, kind: FrameKind, payload: Vec<u8>) -> SyncResult<()> {
        self.tx
            .send((kind, payload))
            .await
            .map_err(|_| SyncError::PeerConnectionLost(format!("session to {} closed", self.peer_id)))
    }
}

/// Identity material and addressing the transport needs for handshakes.
pub struct LocalIdentity {
    pub id: Uuid,
    pub device_name: String,
    pub keypair: Arc<IdentityKeypair>,
}

/// Connection pool plus listener. All sockets live inside the tasks spawned
/// here; callers only ever hold `SessionHandle`s.
pub struct Transport {
    local: LocalIdentity,
    config: Arc<RwLock<Config>>,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    connect_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    inbound: mpsc::Sender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Transport {
    pub fn new(
        local: LocalIdentity,
        config: Arc<RwLock<Config>>,
        inbound: mpsc::Sender<TransportEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            config,
            sessions: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            inbound,
            shutdown,
        })
    }

    /// Bind the transfer listener on the first free port of the configured
    /// range. Returns the listener and the chosen port for beacons.
    pub async fn bind_listener(start: u16, end: u16) -> SyncResult<(TcpListener, u16)> {
        for port in start..=end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    tracing::info!(target: "swarm::transport", "listening on port {}", port);
                    return Ok((listener, port));
                }
                Err(_) => continue,
            }
        }
        Err(SyncError::BindingFailed(format!(
            "no free transfer port in {}..={}",
            start, end
        )))
    }

    /// Accept loop; one task per daemon.
    pub fn start_accepting(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let transport = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let transport = transport.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = transport.handle_inbound(stream, addr).await {
                                        tracing::debug!(
                                            target: "swarm::transport",
                                            "inbound connection from {} failed: {}", addr, e
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!(target: "swarm::transport", "accept failed: {}", e);
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
        })
    }

    /// The live session for a peer, if any.
    pub fn session(&self, peer_id: &Uuid) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(peer_id).cloned()
    }

    pub fn connected_peers(&self) -> Vec<Uuid> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    /// Get or establish the session for a peer. Concurrent callers for the
    /// same peer coalesce onto a single connect attempt.
    pub async fn ensure_session(self: &Arc<Self>, peer: &Peer) -> SyncResult<SessionHandle> {
        if let Some(existing) = self.session(&peer.id) {
            return Ok(existing);
        }
        let lock = {
            let mut locks = self.connect_locks.lock().unwrap();
            locks.entry(peer.id).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;
        // A concurrent attempt may have finished while we waited.
        if let Some(existing) = self.session(&peer.id) {
            return Ok(existing);
        }
        self.connect(peer).await
    }

    async fn connect(self: &Arc<Self>, peer: &Peer) -> SyncResult<SessionHandle> {
        let addr = SocketAddr::new(peer.address, peer.transfer_port);
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| SyncError::PeerConnectionLost(format!("connect to {}: {}", addr, e)))?;
        let mut framed = Framed::new(stream, FrameCodec);

        // Initiator sends the first plaintext frame and waits for the ack.
        let mut exchange = SessionExchange::new();
        let hello = HandshakeRecord::new(
            &self.local.keypair,
            self.local.id,
            self.local.device_name.clone(),
            exchange.public_bytes(),
        );
        framed
            .send(Frame::new(FrameKind::Handshake, encode_payload(&hello)?))
            .await?;

        let ack_frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| SyncError::HandshakeFailed("handshake timed out".to_string()))?
            .ok_or_else(|| SyncError::HandshakeFailed("connection closed mid-handshake".to_string()))??;
        if ack_frame.kind != FrameKind::HandshakeAck {
            return Err(SyncError::HandshakeFailed(format!(
                "expected HandshakeAck, got {:?}",
                ack_frame.kind
            )));
        }
        let ack: HandshakeRecord = decode_payload(&ack_frame.payload)?;
        self.verify_remote(&ack, Some(peer))?;

        let key = exchange.derive(
            &ack.ephemeral_public,
            self.local.id.as_bytes(),
            ack.peer_id.as_bytes(),
        )?;
        // Initiator seals with direction 0 and expects 1.
        self.install_session(framed, ack.peer_id, ack.peer_name, key, 0)
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> SyncResult<()> {
        let mut framed = Framed::new(stream, FrameCodec);
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| SyncError::HandshakeFailed("handshake timed out".to_string()))?
            .ok_or_else(|| SyncError::HandshakeFailed("connection closed mid-handshake".to_string()))??;
        if first.kind != FrameKind::Handshake {
            return Err(SyncError::HandshakeFailed(format!(
                "expected Handshake, got {:?}",
                first.kind
            )));
        }
        let hello: HandshakeRecord = decode_payload(&first.payload)?;
        self.verify_remote(&hello, None)?;

        let mut exchange = SessionExchange::new();
        let ack = HandshakeRecord::new(
            &self.local.keypair,
            self.local.id,
            self.local.device_name.clone(),
            exchange.public_bytes(),
        );
        framed
            .send(Frame::new(FrameKind::HandshakeAck, encode_payload(&ack)?))
            .await?;

        let key = exchange.derive(
            &hello.ephemeral_public,
            self.local.id.as_bytes(),
            hello.peer_id.as_bytes(),
        )?;
        tracing::debug!(target: "swarm::transport", "accepted session from {} ({})", hello.peer_name, addr);
        // Responder seals with direction 1 and expects 0.
        self.install_session(framed, hello.peer_id, hello.peer_name, key, 1)?;
        Ok(())
    }

    /// Check a handshake record: signature, trust record, and (for outbound
    /// connects) the beacon-claimed peer ID.
    fn verify_remote(&self, record: &HandshakeRecord, expected: Option<&Peer>) -> SyncResult<()> {
        record.verify()?;
        if let Some(peer) = expected {
            if record.peer_id != peer.id {
                return Err(SyncError::HandshakeFailed(format!(
                    "peer claims id {} but beacon announced {}",
                    record.peer_id, peer.id
                )));
            }
        }
        let fingerprint = record.fingerprint();
        if !self.config.read().unwrap().is_trusted(&fingerprint) {
            return Err(SyncError::HandshakeFailed(format!(
                "peer {} ({}) is not trusted",
                record.peer_name, fingerprint
            )));
        }
        Ok(())
    }

    fn install_session(
        self: &Arc<Self>,
        framed: Framed<TcpStream, FrameCodec>,
        peer_id: Uuid,
        peer_name: String,
        key: SessionKey,
        direction: u8,
    ) -> SyncResult<SessionHandle> {
        let (tx, rx) = mpsc::channel::<(FrameKind, Vec<u8>)>(64);
        let handle = SessionHandle { peer_id, peer_name: peer_name.clone(), tx };

        // One live connection per peer: a newer session displaces the old,
        // whose tasks wind down when their channels close.
        self.sessions.lock().unwrap().insert(peer_id, handle.clone());

        let (sink, stream) = framed.split();
        let last_traffic = Arc::new(AtomicI64::new(now_ms()));

        let send_cipher = SendCipher { key: key.clone(), direction, counter: 0 };
        let recv_cipher = RecvCipher { key, expect_direction: 1 - direction, last_counter: 0 };

        let writer = tokio::spawn(writer_loop(sink, rx, send_cipher, last_traffic.clone()));
        let transport = self.clone();
        let my_tx = handle.tx.clone();
        tokio::spawn(async move {
            reader_loop(
                stream,
                recv_cipher,
                transport.inbound.clone(),
                my_tx.clone(),
                peer_id,
                last_traffic,
            )
            .await;
            writer.abort();
            let removed = {
                let mut sessions = transport.sessions.lock().unwrap();
                match sessions.get(&peer_id) {
                    // Only remove the entry if it is still ours; a newer
                    // session may already have replaced it.
                    Some(current) if current.tx.same_channel(&my_tx) => {
                        sessions.remove(&peer_id).is_some()
                    }
                    _ => false,
                }
            };
            if removed {
                tracing::info!(target: "swarm::transport", "session with {} closed", peer_id);
                let _ = transport
                    .inbound
                    .send(TransportEvent::PeerDisconnected { peer_id })
                    .await;
            }
        });

        let inbound = self.inbound.clone();
        let established_name = peer_name;
        tokio::spawn(async move {
            let _ = inbound
                .send(TransportEvent::SessionEstablished { peer_id, peer_name: established_name })
                .await;
        });
        Ok(handle)
    }

    /// Drop the session for a peer, closing both tasks.
    pub fn close_session(&self, peer_id: &Uuid) {
        self.sessions.lock().unwrap().remove(peer_id);
    }
}

async fn writer_loop(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut rx: mpsc::Receiver<(FrameKind, Vec<u8>)>,
    mut cipher: SendCipher,
    last_traffic: Arc<AtomicI64>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((kind, payload)) = msg else { break };
                match cipher.seal(kind, &payload) {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                        last_traffic.store(now_ms(), Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!(target: "swarm::transport", "seal failed: {}", e);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let idle_ms = now_ms() - last_traffic.load(Ordering::Relaxed);
                if idle_ms > IDLE_CLOSE.as_millis() as i64 {
                    tracing::debug!(target: "swarm::transport", "closing idle connection");
                    break;
                }
                match cipher.seal(FrameKind::Ping, &[]) {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn reader_loop(
    mut stream: futures::stream::SplitStream<Framed<TcpStream, FrameCodec>>,
    mut cipher: RecvCipher,
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Sender<(FrameKind, Vec<u8>)>,
    peer_id: Uuid,
    last_traffic: Arc<AtomicI64>,
) {
    loop {
        let next = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                tracing::debug!(target: "swarm::transport", "read deadline hit for {}", peer_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(target: "swarm::transport", "read error from {}: {}", peer_id, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let plaintext = match cipher.open(&next) {
            Ok(p) => p,
            Err(e) => {
                // Nonce or tag violations are not recoverable; kill the
                // session rather than risk accepting tampered frames.
                tracing::warn!(target: "swarm::transport", "sealed frame from {} rejected: {}", peer_id, e);
                break;
            }
        };
        last_traffic.store(now_ms(), Ordering::Relaxed);

        match next.kind {
            FrameKind::Ping => {
                let _ = outbound.send((FrameKind::Pong, Vec::new())).await;
            }
            FrameKind::Pong => {}
            FrameKind::Handshake | FrameKind::HandshakeAck => {
                tracing::warn!(target: "swarm::transport", "unexpected handshake frame mid-session from {}", peer_id);
                break;
            }
            kind => {
                // Bounded queue: a full engine pauses this loop, and TCP
                // flow control propagates the pressure to the sender.
                if inbound
                    .send(TransportEvent::Frame { peer_id, kind, payload: plaintext })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::TrustedPeer;

    fn test_key() -> SessionKey {
        SessionKey::new([42u8; 32])
    }

    #[test]
    fn seal_open_roundtrip_with_counters() {
        let mut send = SendCipher { key: test_key(), direction: 0, counter: 0 };
        let mut recv = RecvCipher { key: test_key(), expect_direction: 0, last_counter: 0 };

        for i in 1..=5u64 {
            let frame = send.seal(FrameKind::Manifest, format!("msg {}", i).as_bytes()).unwrap();
            let plain = recv.open(&frame).unwrap();
            assert_eq!(plain, format!("msg {}", i).as_bytes());
        }
        assert_eq!(recv.last_counter, 5);
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let mut send = SendCipher { key: test_key(), direction: 0, counter: 0 };
        let mut recv = RecvCipher { key: test_key(), expect_direction: 0, last_counter: 0 };

        let frame = send.seal(FrameKind::Ping, &[]).unwrap();
        recv.open(&frame).unwrap();
        let err = recv.open(&frame).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn out_of_order_frame_is_rejected() {
        let mut send = SendCipher { key: test_key(), direction: 0, counter: 0 };
        let mut recv = RecvCipher { key: test_key(), expect_direction: 0, last_counter: 0 };

        let first = send.seal(FrameKind::Ping, &[]).unwrap();
        let second = send.seal(FrameKind::Ping, &[]).unwrap();
        recv.open(&second).unwrap();
        assert!(recv.open(&first).is_err());
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let mut send = SendCipher { key: test_key(), direction: 1, counter: 0 };
        let mut recv = RecvCipher { key: test_key(), expect_direction: 0, last_counter: 0 };
        let frame = send.seal(FrameKind::Ping, &[]).unwrap();
        assert!(recv.open(&frame).is_err());
    }

    #[test]
    fn tampered_kind_fails_aad() {
        let mut send = SendCipher { key: test_key(), direction: 0, counter: 0 };
        let mut recv = RecvCipher { key: test_key(), expect_direction: 0, last_counter: 0 };
        let mut frame = send.seal(FrameKind::Manifest, b"payload").unwrap();
        frame.kind = FrameKind::Delete;
        assert!(recv.open(&frame).is_err());
    }

    #[tokio::test]
    async fn two_transports_establish_a_session() {
        let (config_a, identity_a, id_a) = trusted_pair_config();
        let (config_b, identity_b, id_b) = trusted_pair_config();

        // Cross-trust the two identities
        cross_trust(&config_a, id_b, &identity_b);
        cross_trust(&config_b, id_a, &identity_a);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_a, _rx_a) = mpsc::channel(INBOUND_QUEUE_FRAMES);
        let (inbound_b, mut rx_b) = mpsc::channel(INBOUND_QUEUE_FRAMES);

        let transport_a = Transport::new(
            LocalIdentity { id: id_a, device_name: "a".to_string(), keypair: identity_a },
            config_a,
            inbound_a,
            shutdown_rx.clone(),
        );
        let transport_b = Transport::new(
            LocalIdentity { id: id_b, device_name: "b".to_string(), keypair: identity_b.clone() },
            config_b,
            inbound_b,
            shutdown_rx,
        );

        let (listener, port) = Transport::bind_listener(53000, 53099).await.unwrap();
        transport_b.start_accepting(listener);

        let peer_b = Peer {
            id: id_b,
            name: "b".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            transfer_port: port,
            identity_public_key: identity_b.public_bytes().to_vec(),
            last_seen_ms: now_ms(),
            sync_enabled: true,
        };
        let session = transport_a.ensure_session(&peer_b).await.unwrap();
        session.send(FrameKind::Manifest, b"hello".to_vec()).await.unwrap();

        // B observes the session, then the sealed frame.
        let mut saw_frame = false;
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap() {
                Some(TransportEvent::Frame { peer_id, kind, payload }) => {
                    assert_eq!(peer_id, id_a);
                    assert_eq!(kind, FrameKind::Manifest);
                    assert_eq!(payload, b"hello");
                    saw_frame = true;
                    break;
                }
                Some(TransportEvent::SessionEstablished { peer_id, .. }) => {
                    assert_eq!(peer_id, id_a);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(saw_frame);

        // Coalesced: a second ensure returns the same session.
        let again = transport_a.ensure_session(&peer_b).await.unwrap();
        assert!(again.tx.same_channel(&session.tx));
    }

    #[tokio::test]
    async fn untrusted_peer_is_refused() {
        let (config_a, identity_a, id_a) = trusted_pair_config();
        let (config_b, identity_b, id_b) = trusted_pair_config();
        // Only A trusts B; B does not trust A.
        cross_trust(&config_a, id_b, &identity_b);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_a, _rx_a) = mpsc::channel(INBOUND_QUEUE_FRAMES);
        let (inbound_b, _rx_b) = mpsc::channel(INBOUND_QUEUE_FRAMES);

        let transport_a = Transport::new(
            LocalIdentity { id: id_a, device_name: "a".to_string(), keypair: identity_a },
            config_a,
            inbound_a,
            shutdown_rx.clone(),
        );
        let transport_b = Transport::new(
            LocalIdentity { id: id_b, device_name: "b".to_string(), keypair: identity_b.clone() },
            config_b,
            inbound_b,
            shutdown_rx,
        );

        let (listener, port) = Transport::bind_listener(53100, 53199).await.unwrap();
        transport_b.start_accepting(listener);

        let peer_b = Peer {
            id: id_b,
            name: "b".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            transfer_port: port,
            identity_public_key: identity_b.public_bytes().to_vec(),
            last_seen_ms: now_ms(),
            sync_enabled: true,
        };
        assert!(transport_a.ensure_session(&peer_b).await.is_err());
    }

    fn trusted_pair_config() -> (Arc<RwLock<Config>>, Arc<IdentityKeypair>, Uuid) {
        let config = Arc::new(RwLock::new(Config::default()));
        let identity = Arc::new(IdentityKeypair::generate());
        (config, identity, Uuid::new_v4())
    }

    fn cross_trust(config: &Arc<RwLock<Config>>, peer_id: Uuid, identity: &IdentityKeypair) {
        config.write().unwrap().trust_peer(TrustedPeer {
            peer_id,
            fingerprint: identity.fingerprint(),
            display_name: "test".to_string(),
            trusted_at: chrono::Utc::now(),
            auto_resolve: None,
        });
    }
}
