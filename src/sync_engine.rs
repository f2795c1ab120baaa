/// Sync Engine Module
///
/// The planner at the center of the daemon. A single task consumes the
/// debounced watcher events, transport frames, internal commands from helper
/// tasks, and the periodic rescan tick, and turns them into repository
/// updates, disk writes, and outgoing frames.
///
/// Local change pipeline: ignore filter → hash (bounded worker pool) →
/// benign-touch dedup → pre-change version snapshot → repository upsert →
/// fan-out to online trusted peers (delta path for large updates) →
/// activity log.
///
/// Remote change pipeline: session trust is already established by the
/// transport; each incoming change runs conflict detection against the
/// repository record and the on-disk content, takes a version snapshot,
/// assembles bodies into temp files, verifies hashes, and applies
/// atomically.
///
/// Gating: the schedule, manual pause, and battery state decide whether
/// outbound traffic flows; deferred work queues until a wake timer at the
/// next allowed window. Inbound frames queue while paused, bounded, with
/// back-pressure beyond the bound.
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog, ActivitySeverity};
use crate::config::Config;
use crate::conflict::{
    decide_auto, keep_both_name, ConflictRecord, ConflictResolution, ConflictResolver,
    ResolutionMethod,
};
use crate::crypto;
use crate::delta::{self, BLOCK_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::ignore::IgnoreMatcher;
use crate::peer::{Peer, PeerTable};
use crate::power::{PowerStatus, BULK_TRANSFER_BYTES};
use crate::protocol::{
    decode_payload, encode_payload, DeltaPayload, ErrorPayload, FileChunkPayload, FileEndPayload,
    FileHeaderPayload, FileRequestPayload, FrameKind, ManifestPayload, SignaturesPayload,
    SignaturesRequestPayload,
};
use crate::schedule::now_ms;
use crate::state_store::{FileAction, StateStore, SyncedFile, TransferDirection};
use crate::transfer::{self, IncomingTransfer};
use crate::transport::{SessionHandle, Transport, TransportEvent};
use crate::vault::{VaultManager, ENCRYPTED_EXTENSION, VAULT_DIR};
use crate::versioning::{SnapshotReason, VersionStore};
use crate::watcher::{WatchEvent, WatchKind};

/// Window for collapsing a delete+create pair into a rename.
const RENAME_COALESCE_MS: i64 = 2_000;

/// Signatures that do not arrive within this budget fall back to full send.
const SIGNATURES_TIMEOUT_MS: i64 = 30_000;

/// Cap on concurrently running transfer executors.
const MAX_ACTIVE_TRANSFERS: usize = 8;

/// Inbound frames queued during a manual pause.
const PAUSED_INBOUND_CAP: usize = 10_000;

/// How an assembling incoming body will be used once complete.
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Apply,
    ConflictCopy(String),
    Discard,
    AwaitingResolution,
}

/// Outcome of conflict detection for one incoming change.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingClass {
    /// Already in sync; drop the change.
    InSync,
    /// Non-conflicting; apply (or request) it.
    Accept,
    /// Divergent local edit; needs resolution.
    Conflict,
}

/// Pure conflict-detection rule over the repository record, the hash of the
/// file currently on disk, and the incoming hash.
pub fn classify_incoming(
    repo_hash: Option<&str>,
    disk_hash: Option<&str>,
    incoming_hash: &str,
) -> IncomingClass {
    match (repo_hash, disk_hash) {
        (None, None) => IncomingClass::Accept,
        (None, Some(disk)) => {
            if disk == incoming_hash {
                IncomingClass::InSync
            } else {
                IncomingClass::Conflict
            }
        }
        (Some(repo), disk) => {
            if repo == incoming_hash {
                IncomingClass::InSync
            } else {
                match disk {
                    // Disk still matches the recorded state: clean update.
                    Some(d) if d == repo => IncomingClass::Accept,
                    // Locally deleted; restoring the remote version is not a
                    // conflict.
                    None => IncomingClass::Accept,
                    Some(d) if d == incoming_hash => IncomingClass::InSync,
                    Some(_) => IncomingClass::Conflict,
                }
            }
        }
    }
}

struct PendingDelete {
    state: SyncedFile,
    at_ms: i64,
}

struct PendingDelta {
    state: SyncedFile,
    requested_at_ms: i64,
}

struct PendingConflict {
    record: ConflictRecord,
    /// Set once the body finished assembling: (temp path, draft state).
    ready: Option<(PathBuf, SyncedFile)>,
}

#[derive(Default)]
struct EngineState {
    incoming: HashMap<Uuid, IncomingTransfer>,
    dispositions: HashMap<Uuid, Disposition>,
    pending_deltas: HashMap<(Uuid, String), PendingDelta>,
    pending_deletes: HashMap<String, PendingDelete>,
    awaiting_resolution: HashMap<(Uuid, String), PendingConflict>,
    deferred_outbound: Vec<(SyncedFile, bool)>,
    deferred_inbound: VecDeque<TransportEvent>,
}

enum EngineCommand {
    ConflictDecided {
        peer_id: Uuid,
        relative_path: String,
        resolution: ConflictResolution,
        method: ResolutionMethod,
    },
    FinalizeDelete {
        relative_path: String,
        content_hash: String,
    },
}

/// The sync engine. Wired once by the supervisor; `run` is its only loop.
pub struct SyncEngine {
    pub sync_root: PathBuf,
    pub local_id: Uuid,
    config: Arc<RwLock<Config>>,
    store: Arc<StateStore>,
    transport: Arc<Transport>,
    peer_table: Arc<PeerTable>,
    ignore: Arc<IgnoreMatcher>,
    vault: Arc<VaultManager>,
    versions: Arc<VersionStore>,
    activity: Arc<ActivityLog>,
    events: EventBus,
    power: Arc<dyn PowerStatus>,
    resolver: Arc<dyn ConflictResolver>,
    hash_pool: Arc<Semaphore>,
    transfer_pool: Arc<Semaphore>,
    file_locks: Mutex<HashMap<(Uuid, String), Arc<tokio::sync::Mutex<()>>>>,
    cmd_tx: mpsc::Sender<EngineCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<EngineCommand>>>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync_root: PathBuf,
        local_id: Uuid,
        config: Arc<RwLock<Config>>,
        store: Arc<StateStore>,
        transport: Arc<Transport>,
        peer_table: Arc<PeerTable>,
        ignore: Arc<IgnoreMatcher>,
        vault: Arc<VaultManager>,
        versions: Arc<VersionStore>,
        activity: Arc<ActivityLog>,
        events: EventBus,
        power: Arc<dyn PowerStatus>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Arc<Self> {
        let hash_workers = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        Arc::new(Self {
            sync_root,
            local_id,
            config,
            store,
            transport,
            peer_table,
            ignore,
            vault,
            versions,
            activity,
            events,
            power,
            resolver,
            hash_pool: Arc::new(Semaphore::new(hash_workers)),
            transfer_pool: Arc::new(Semaphore::new(MAX_ACTIVE_TRANSFERS)),
            file_locks: Mutex::new(HashMap::new()),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        })
    }

    /// The planner loop. Single-threaded by construction; every mutation of
    /// engine state happens here.
    pub async fn run(
        self: Arc<Self>,
        mut watch_rx: mpsc::Receiver<WatchEvent>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut state = EngineState::default();
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap()
            .take()
            .expect("engine run() started twice");

        let rescan_minutes = self.config.read().unwrap().network.rescan_interval_minutes.max(1);
        let mut rescan_tick = tokio::time::interval(Duration::from_secs(rescan_minutes * 60));
        rescan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        rescan_tick.tick().await; // immediate first tick; startup rescan runs below

        if let Err(e) = self.rescan(&mut state).await {
            tracing::warn!(target: "swarm::engine", "startup rescan failed: {}", e);
        }

        loop {
            let gate_wake = self.next_gate_wake(&state);
            let inbound_open = state.deferred_inbound.len() < PAUSED_INBOUND_CAP;
            tokio::select! {
                event = watch_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle_watch_event(&mut state, event).await {
                        tracing::warn!(target: "swarm::engine", "local change failed: {}", e);
                    }
                }
                event = transport_rx.recv(), if inbound_open => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(&mut state, event).await;
                }
                Some(command) = cmd_rx.recv() => {
                    self.handle_command(&mut state, command).await;
                }
                _ = rescan_tick.tick() => {
                    if let Err(e) = self.rescan(&mut state).await {
                        tracing::warn!(target: "swarm::engine", "rescan failed: {}", e);
                    }
                }
                _ = sleep_until_opt(gate_wake) => {
                    self.flush_deferred(&mut state).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.expire_pending_deltas(&mut state).await;
        }
        tracing::info!(target: "swarm::engine", "sync engine stopped");
    }

    // -------------------------------------------------------------------
    // Gating
    // -------------------------------------------------------------------

    fn gate_allows_outbound(&self, size: u64) -> bool {
        let config = self.config.read().unwrap();
        if !config.sync_enabled {
            return false;
        }
        if config.is_paused_at(chrono::Utc::now()) {
            return false;
        }
        if !config.schedule.is_sync_allowed_now() {
            return false;
        }
        if size >= BULK_TRANSFER_BYTES && !self.power.allows_bulk_transfers() {
            return false;
        }
        true
    }

    fn inbound_gated(&self) -> bool {
        let config = self.config.read().unwrap();
        config.is_paused_at(chrono::Utc::now()) || !config.schedule.is_sync_allowed_now()
    }

    fn next_gate_wake(&self, state: &EngineState) -> Option<tokio::time::Instant> {
        if state.deferred_outbound.is_empty() && state.deferred_inbound.is_empty() {
            return None;
        }
        let config = self.config.read().unwrap();
        let mut wake_ms: i64 = 30_000;
        if let Some(until) = config.pause_until {
            let delta = until.timestamp_millis() - now_ms();
            if delta > 0 {
                wake_ms = wake_ms.min(delta);
            }
        }
        if let Some(next) = config.schedule.next_transition_after(chrono::Local::now()) {
            let delta = next.timestamp_millis() - now_ms();
            if delta > 0 {
                wake_ms = wake_ms.min(delta);
            }
        }
        Some(tokio::time::Instant::now() + Duration::from_millis(wake_ms.max(250) as u64))
    }

    async fn flush_deferred(&self, state: &mut EngineState) {
        if !self.inbound_gated() {
            while let Some(event) = state.deferred_inbound.pop_front() {
                Box::pin(self.handle_transport_event(state, event)).await;
            }
        }
        let deferred = std::mem::take(&mut state.deferred_outbound);
        for (change, had_prior) in deferred {
            self.broadcast_change(state, change, had_prior).await;
        }
    }

    // -------------------------------------------------------------------
    // Local pipeline
    // -------------------------------------------------------------------

    async fn handle_watch_event(&self, state: &mut EngineState, event: WatchEvent) -> SyncResult<()> {
        let rel = event.relative_path;
        let abs = self.sync_root.join(&rel);
        let is_dir = abs.is_dir();
        if self.ignore.is_ignored(&rel, is_dir) {
            return Ok(());
        }

        match event.kind {
            WatchKind::Created | WatchKind::Modified => {
                if let Some(folder) = self.vault_folder_of(&rel) {
                    return self.handle_vault_plaintext(&folder, &rel, &abs);
                }
                if is_dir {
                    self.process_local_directory(state, rel).await
                } else if abs.is_file() {
                    self.process_local_upsert(state, rel, None).await
                } else {
                    Ok(())
                }
            }
            WatchKind::Removed => self.process_local_delete(state, rel).await,
            WatchKind::Renamed { old_relative_path } => {
                if abs.is_file() || is_dir {
                    self.process_local_upsert(state, rel, Some(old_relative_path)).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// A plaintext file landed inside an encrypted folder: swallow it into
    /// the vault. The resulting `.senc` body syncs as an ordinary file.
    fn handle_vault_plaintext(&self, folder: &str, rel: &str, abs: &Path) -> SyncResult<()> {
        if !abs.is_file() {
            return Ok(());
        }
        if self.vault.is_locked(folder) {
            tracing::warn!(
                target: "swarm::vault",
                "plaintext {} arrived in locked vault {}; not syncing until unlocked", rel, folder
            );
            return Ok(());
        }
        let name = rel.strip_prefix(folder).unwrap_or(rel).trim_start_matches('/');
        let obfuscated = self.vault.encrypt_file(folder, abs, name)?;
        self.log_activity(
            ActivityEntry::new(ActivityKind::VaultCreated, ActivitySeverity::Info, "file encrypted into vault")
                .with_path(format!("{}/{}", folder, obfuscated)),
        );
        Ok(())
    }

    fn vault_folder_of(&self, rel: &str) -> Option<String> {
        if rel.ends_with(&format!(".{}", ENCRYPTED_EXTENSION)) || rel.contains(VAULT_DIR) {
            return None;
        }
        let folders = self.config.read().unwrap().encrypted_folders.clone();
        folders
            .into_iter()
            .find(|f| rel.starts_with(&format!("{}/", f)))
    }

    async fn process_local_directory(&self, state: &mut EngineState, rel: String) -> SyncResult<()> {
        if self.store.exists(&rel) {
            return Ok(());
        }
        let record = SyncedFile {
            relative_path: rel.clone(),
            content_hash: String::new(),
            size: 0,
            last_modified_ms: now_ms(),
            action: FileAction::Create,
            source_peer_id: String::new(),
            is_directory: true,
            old_relative_path: None,
        };
        self.store.add_or_update(&record)?;
        self.broadcast_change(state, record, false).await;
        Ok(())
    }

    async fn process_local_upsert(
        &self,
        state: &mut EngineState,
        rel: String,
        rename_from: Option<String>,
    ) -> SyncResult<()> {
        let abs = self.sync_root.join(&rel);
        if abs.is_dir() {
            return self.process_local_directory(state, rel).await;
        }
        let metadata = match std::fs::metadata(&abs) {
            Ok(m) => m,
            Err(_) => return Ok(()), // vanished between event and processing
        };
        let hash = self.hash_file(&abs).await?;
        let prior = self.store.get(&rel);

        // Benign touch: content unchanged.
        if rename_from.is_none() {
            if let Some(existing) = &prior {
                if existing.content_hash == hash && existing.action != FileAction::Delete {
                    return Ok(());
                }
            }
        }

        // A freshly created file whose content matches a just-deleted one is
        // the second half of a rename.
        let rename_from = rename_from.or_else(|| {
            let pending = state.pending_deletes.remove(&hash)?;
            if now_ms() - pending.at_ms <= RENAME_COALESCE_MS {
                Some(pending.state.relative_path)
            } else {
                None
            }
        });

        let had_prior = prior.as_ref().map(|p| p.action != FileAction::Delete).unwrap_or(false);
        let (action, old_path) = match &rename_from {
            Some(old) => (FileAction::Rename, Some(old.clone())),
            None if had_prior => (FileAction::Update, None),
            None => (FileAction::Create, None),
        };

        if action == FileAction::Update {
            self.snapshot(&rel, SnapshotReason::Update);
        }
        if let Some(old) = &old_path {
            self.snapshot(old, SnapshotReason::Rename);
            self.store.remove(old)?;
        }

        let record = SyncedFile {
            relative_path: rel.clone(),
            content_hash: hash,
            size: metadata.len(),
            last_modified_ms: file_mtime_ms(&metadata),
            action,
            source_peer_id: String::new(),
            is_directory: false,
            old_relative_path: old_path,
        };
        self.store.add_or_update(&record)?;
        self.log_activity(
            ActivityEntry::new(local_activity_kind(action), ActivitySeverity::Info, "local change")
                .with_path(rel),
        );
        self.broadcast_change(state, record, had_prior).await;
        Ok(())
    }

    async fn process_local_delete(&self, state: &mut EngineState, rel: String) -> SyncResult<()> {
        let Some(record) = self.store.get(&rel) else { return Ok(()) };
        if record.action == FileAction::Delete {
            return Ok(());
        }

        // Hold the delete briefly: a matching create within the window turns
        // the pair into a rename.
        if !record.is_directory && !record.content_hash.is_empty() {
            state.pending_deletes.insert(
                record.content_hash.clone(),
                PendingDelete { state: record.clone(), at_ms: now_ms() },
            );
            let cmd_tx = self.cmd_tx.clone();
            let hash = record.content_hash.clone();
            let path = rel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(RENAME_COALESCE_MS as u64 + 100)).await;
                let _ = cmd_tx
                    .send(EngineCommand::FinalizeDelete { relative_path: path, content_hash: hash })
                    .await;
            });
            return Ok(());
        }
        self.finalize_local_delete(state, record).await
    }

    async fn finalize_local_delete(&self, state: &mut EngineState, record: SyncedFile) -> SyncResult<()> {
        self.snapshot(&record.relative_path, SnapshotReason::Delete);
        let tombstone = SyncedFile {
            action: FileAction::Delete,
            content_hash: String::new(),
            size: 0,
            last_modified_ms: now_ms(),
            source_peer_id: String::new(),
            old_relative_path: None,
            ..record
        };
        self.store.add_or_update(&tombstone)?;
        self.log_activity(
            ActivityEntry::new(ActivityKind::FileDeleted, ActivitySeverity::Info, "local delete")
                .with_path(tombstone.relative_path.clone()),
        );
        self.broadcast_change(state, tombstone, true).await;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------

    async fn broadcast_change(&self, state: &mut EngineState, change: SyncedFile, had_prior: bool) {
        if !self.gate_allows_outbound(change.size) {
            state.deferred_outbound.push((change, had_prior));
            return;
        }
        let delta_threshold = self.config.read().unwrap().network.delta_threshold_bytes;
        let peers = self.trusted_online_peers();
        for peer in peers {
            let Ok(session) = self.transport.ensure_session(&peer).await else {
                tracing::debug!(target: "swarm::engine", "no session to {} for fan-out", peer.name);
                continue;
            };
            let result = match change.action {
                FileAction::Delete => self.send_state_frame(&session, FrameKind::Delete, &change).await,
                FileAction::Rename => self.send_state_frame(&session, FrameKind::Rename, &change).await,
                _ if change.is_directory => {
                    self.send_state_frame(&session, FrameKind::DirectoryCreate, &change).await
                }
                _ if change.size >= delta_threshold && had_prior => {
                    // Delta path: ask the peer for its block signatures.
                    state.pending_deltas.insert(
                        (peer.id, change.relative_path.clone()),
                        PendingDelta { state: change.clone(), requested_at_ms: now_ms() },
                    );
                    self.send_signatures_request(&session, &change.relative_path).await
                }
                _ => {
                    self.spawn_send_file(session.clone(), change.clone(), 0);
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(
                    target: "swarm::engine",
                    "fan-out of {} to {} failed: {}", change.relative_path, peer.name, e
                );
            }
        }
    }

    fn trusted_online_peers(&self) -> Vec<Peer> {
        let config = self.config.read().unwrap();
        self.peer_table
            .online()
            .into_iter()
            .filter(|p| p.sync_enabled && config.is_trusted(&p.fingerprint()))
            .collect()
    }

    async fn send_state_frame(
        &self,
        session: &SessionHandle,
        kind: FrameKind,
        state: &SyncedFile,
    ) -> SyncResult<()> {
        session.send(kind, encode_payload(state)?).await
    }

    async fn send_signatures_request(&self, session: &SessionHandle, rel: &str) -> SyncResult<()> {
        let payload = SignaturesRequestPayload { relative_path: rel.to_string() };
        session.send(FrameKind::SignaturesRequest, encode_payload(&payload)?).await
    }

    /// Stream a file body on a dedicated executor; per-(peer, file) locks
    /// keep a second dispatch of the same file from starting until the
    /// first finishes.
    fn spawn_send_file(&self, session: SessionHandle, state: SyncedFile, start_offset: u64) {
        let store = self.store.clone();
        let events = self.events.clone();
        let sync_root = self.sync_root.clone();
        let pool = self.transfer_pool.clone();
        let lock = self.file_lock(session.peer_id, &state.relative_path);
        let activity = self.activity.clone();
        let bus = self.events.clone();
        tokio::spawn(async move {
            let _permit = pool.acquire().await;
            let _guard = lock.lock().await;
            if let Err(e) =
                transfer::send_file(&session, &store, &events, &sync_root, &state, start_offset).await
            {
                tracing::warn!(
                    target: "swarm::transfer",
                    "send of {} to {} failed: {}", state.relative_path, session.peer_name, e
                );
                bus.emit(SyncEvent::TransferFailed {
                    relative_path: state.relative_path.clone(),
                    peer_id: session.peer_id,
                    reason: e.to_string(),
                });
                activity.append(
                    ActivityEntry::new(ActivityKind::TransferFailed, ActivitySeverity::Warning, e.to_string())
                        .with_path(state.relative_path.clone())
                        .with_peer(session.peer_id.to_string()),
                );
            }
        });
    }

    fn file_lock(&self, peer: Uuid, rel: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.file_locks
            .lock()
            .unwrap()
            .entry((peer, rel.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------
    // Remote pipeline
    // -------------------------------------------------------------------

    async fn handle_transport_event(&self, state: &mut EngineState, event: TransportEvent) {
        match event {
            TransportEvent::SessionEstablished { peer_id, peer_name } => {
                self.on_session_established(peer_id, peer_name).await;
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                self.on_peer_disconnected(state, peer_id);
            }
            TransportEvent::Frame { peer_id, kind, payload } => {
                // Manual pause defers the apply stage; frames queue bounded.
                if self.inbound_gated() && !matches!(kind, FrameKind::Error) {
                    state
                        .deferred_inbound
                        .push_back(TransportEvent::Frame { peer_id, kind, payload });
                    return;
                }
                if let Err(e) = self.on_frame(state, peer_id, kind, payload).await {
                    tracing::warn!(
                        target: "swarm::engine",
                        "frame {:?} from {} failed: {}", kind, peer_id, e
                    );
                }
            }
        }
    }

    async fn on_session_established(&self, peer_id: Uuid, peer_name: String) {
        tracing::info!(target: "swarm::engine", "session with {} established", peer_name);
        transfer::prune_stale_checkpoints(&self.store, &peer_id);

        let Some(session) = self.transport.session(&peer_id) else { return };

        // Manifest first, then resume requests for partial bodies.
        let manifest = ManifestPayload { files: self.store.snapshot() };
        match encode_payload(&manifest) {
            Ok(payload) => {
                if let Err(e) = session.send(FrameKind::Manifest, payload).await {
                    tracing::warn!(target: "swarm::engine", "manifest send failed: {}", e);
                    return;
                }
            }
            Err(e) => {
                tracing::error!(target: "swarm::engine", "manifest encode failed: {}", e);
                return;
            }
        }

        for checkpoint in transfer::resumable_incoming(&self.store, &peer_id) {
            let request = FileRequestPayload { relative_path: checkpoint.relative_path.clone() };
            if let Ok(payload) = encode_payload(&request) {
                let _ = session.send(FrameKind::FileRequest, payload).await;
            }
        }
    }

    fn on_peer_disconnected(&self, state: &mut EngineState, peer_id: Uuid) {
        let stalled: Vec<Uuid> = state
            .incoming
            .iter()
            .filter(|(_, t)| t.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        for transfer_id in stalled {
            state.dispositions.remove(&transfer_id);
            if let Some(incoming) = state.incoming.remove(&transfer_id) {
                let path = incoming.relative_path.clone();
                match incoming.abort(&self.store) {
                    Ok(true) => {
                        tracing::info!(
                            target: "swarm::transfer",
                            "checkpointed partial {} after disconnect", path
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(target: "swarm::transfer", "abort of {} failed: {}", path, e);
                    }
                }
            }
        }
        state.pending_deltas.retain(|(peer, _), _| *peer != peer_id);
    }

    async fn on_frame(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        kind: FrameKind,
        payload: Vec<u8>,
    ) -> SyncResult<()> {
        match kind {
            FrameKind::Manifest => {
                let manifest: ManifestPayload = decode_payload(&payload)?;
                self.handle_manifest(state, peer_id, manifest).await
            }
            FrameKind::FileRequest => {
                let request: FileRequestPayload = decode_payload(&payload)?;
                self.handle_file_request(state, peer_id, request).await
            }
            FrameKind::FileHeader => {
                let header: FileHeaderPayload = decode_payload(&payload)?;
                self.handle_file_header(state, peer_id, header).await
            }
            FrameKind::FileChunk => {
                let chunk: FileChunkPayload = decode_payload(&payload)?;
                self.handle_file_chunk(state, peer_id, chunk)
            }
            FrameKind::FileEnd => {
                let end: FileEndPayload = decode_payload(&payload)?;
                self.handle_file_end(state, peer_id, end).await
            }
            FrameKind::Delete => {
                let remote: SyncedFile = decode_payload(&payload)?;
                self.handle_remote_delete(peer_id, remote).await
            }
            FrameKind::Rename => {
                let remote: SyncedFile = decode_payload(&payload)?;
                self.handle_remote_rename(peer_id, remote).await
            }
            FrameKind::DirectoryCreate => {
                let remote: SyncedFile = decode_payload(&payload)?;
                self.handle_remote_directory(peer_id, remote)
            }
            FrameKind::SignaturesRequest => {
                let request: SignaturesRequestPayload = decode_payload(&payload)?;
                self.handle_signatures_request(peer_id, request).await
            }
            FrameKind::Signatures => {
                let signatures: SignaturesPayload = decode_payload(&payload)?;
                self.handle_signatures(state, peer_id, signatures).await
            }
            FrameKind::DeltaData => {
                let delta: DeltaPayload = decode_payload(&payload)?;
                self.handle_delta_data(state, peer_id, delta).await
            }
            FrameKind::Error => {
                let error: ErrorPayload = decode_payload(&payload)?;
                tracing::warn!(
                    target: "swarm::engine",
                    "peer {} reported error {}: {}", peer_id, error.code, error.text
                );
                Ok(())
            }
            other => Err(SyncError::Protocol(format!("unexpected frame {:?}", other))),
        }
    }

    async fn handle_manifest(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        manifest: ManifestPayload,
    ) -> SyncResult<()> {
        tracing::info!(
            target: "swarm::engine",
            "manifest from {} with {} entries", peer_id, manifest.files.len()
        );
        for remote in manifest.files {
            if self.ignore.is_ignored(&remote.relative_path, remote.is_directory) {
                continue;
            }
            if remote.is_directory {
                self.handle_remote_directory(peer_id, remote)?;
                continue;
            }
            if remote.action == FileAction::Delete {
                self.handle_remote_delete(peer_id, remote).await?;
                continue;
            }
            self.consider_remote_file(state, peer_id, remote).await?;
        }
        Ok(())
    }

    /// Decide what to do about a file a peer's manifest advertises.
    async fn consider_remote_file(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        remote: SyncedFile,
    ) -> SyncResult<()> {
        let repo = self.store.get(&remote.relative_path);
        let disk_hash = self.disk_hash(&remote.relative_path).await?;
        let class = classify_incoming(
            repo.as_ref().map(|r| r.content_hash.as_str()),
            disk_hash.as_deref(),
            &remote.content_hash,
        );
        match class {
            IncomingClass::InSync => {
                // Adopt untracked-but-identical content into the repository.
                if repo.is_none() && disk_hash.is_some() {
                    let mut adopted = remote.clone();
                    adopted.source_peer_id = peer_id.to_string();
                    self.store.add_or_update(&adopted)?;
                }
                Ok(())
            }
            IncomingClass::Accept => {
                // Only pull versions that are actually newer than what the
                // repository knows.
                let stale = repo
                    .as_ref()
                    .map(|r| remote.last_modified_ms <= r.last_modified_ms && r.action != FileAction::Delete)
                    .unwrap_or(false);
                if stale {
                    return Ok(());
                }
                self.request_file(peer_id, &remote.relative_path).await
            }
            IncomingClass::Conflict => {
                let record = self.build_conflict_record(&remote, repo.as_ref(), disk_hash, peer_id);
                self.open_conflict(state, peer_id, record).await;
                Ok(())
            }
        }
    }

    async fn request_file(&self, peer_id: Uuid, rel: &str) -> SyncResult<()> {
        let Some(session) = self.transport.session(&peer_id) else {
            return Err(SyncError::PeerConnectionLost(format!("no session to {}", peer_id)));
        };
        let payload = encode_payload(&FileRequestPayload { relative_path: rel.to_string() })?;
        session.send(FrameKind::FileRequest, payload).await
    }

    async fn handle_file_request(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        request: FileRequestPayload,
    ) -> SyncResult<()> {
        let Some(session) = self.transport.session(&peer_id) else { return Ok(()) };
        let Some(record) = self.store.get(&request.relative_path) else {
            let payload = encode_payload(&ErrorPayload {
                code: 404,
                text: format!("{} is not tracked here", request.relative_path),
            })?;
            return session.send(FrameKind::Error, payload).await;
        };
        if record.action == FileAction::Delete || record.is_directory {
            return Ok(());
        }
        let delta_threshold = self.config.read().unwrap().network.delta_threshold_bytes;
        if record.size >= delta_threshold {
            // Large file: ask the requester for signatures over whatever it
            // already holds (a prior version or a checkpointed partial).
            state.pending_deltas.insert(
                (peer_id, record.relative_path.clone()),
                PendingDelta { state: record.clone(), requested_at_ms: now_ms() },
            );
            self.send_signatures_request(&session, &record.relative_path).await
        } else {
            self.spawn_send_file(session, record, 0);
            Ok(())
        }
    }

    async fn handle_file_header(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        header: FileHeaderPayload,
    ) -> SyncResult<()> {
        if self.ignore.is_ignored(&header.relative_path, false) {
            return Err(SyncError::IgnoredPath(header.relative_path));
        }
        let temp_override = if header.start_offset > 0 {
            self.store
                .get_checkpoint(&header.relative_path, &peer_id.to_string())?
                .map(|cp| PathBuf::from(cp.temp_file_path))
        } else {
            None
        };

        let disposition = self.decide_disposition(state, peer_id, &header).await?;
        let incoming = IncomingTransfer::begin(&self.sync_root, &header, peer_id, temp_override)?;
        self.events.emit(SyncEvent::TransferStarted {
            relative_path: header.relative_path.clone(),
            peer_id,
            direction: TransferDirection::Incoming,
            total_bytes: header.size,
        });
        state.dispositions.insert(header.transfer_id, disposition);
        state.incoming.insert(header.transfer_id, incoming);
        Ok(())
    }

    async fn decide_disposition(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        header: &FileHeaderPayload,
    ) -> SyncResult<Disposition> {
        let repo = self.store.get(&header.relative_path);
        let disk_hash = self.disk_hash(&header.relative_path).await?;
        let class = classify_incoming(
            repo.as_ref().map(|r| r.content_hash.as_str()),
            disk_hash.as_deref(),
            &header.content_hash,
        );
        Ok(match class {
            IncomingClass::InSync => Disposition::Discard,
            IncomingClass::Accept => Disposition::Apply,
            IncomingClass::Conflict => {
                let remote = SyncedFile {
                    relative_path: header.relative_path.clone(),
                    content_hash: header.content_hash.clone(),
                    size: header.size,
                    last_modified_ms: header.last_modified_ms,
                    action: FileAction::Update,
                    source_peer_id: peer_id.to_string(),
                    is_directory: false,
                    old_relative_path: None,
                };
                let record = self.build_conflict_record(&remote, repo.as_ref(), disk_hash, peer_id);
                match self.auto_resolution(peer_id, &record) {
                    Some(resolution) => {
                        self.record_resolution(&record, resolution, ResolutionMethod::Auto);
                        self.disposition_for(peer_id, &record, resolution).await
                    }
                    None => {
                        self.open_conflict(state, peer_id, record).await;
                        Disposition::AwaitingResolution
                    }
                }
            }
        })
    }

    fn build_conflict_record(
        &self,
        remote: &SyncedFile,
        repo: Option<&SyncedFile>,
        disk_hash: Option<String>,
        peer_id: Uuid,
    ) -> ConflictRecord {
        let local_mtime = std::fs::metadata(self.sync_root.join(&remote.relative_path))
            .map(|m| file_mtime_ms(&m))
            .unwrap_or_else(|_| repo.map(|r| r.last_modified_ms).unwrap_or(0));
        ConflictRecord {
            relative_path: remote.relative_path.clone(),
            local_hash: disk_hash
                .or_else(|| repo.map(|r| r.content_hash.clone()))
                .unwrap_or_default(),
            remote_hash: remote.content_hash.clone(),
            local_modified_ms: local_mtime,
            remote_modified_ms: remote.last_modified_ms,
            source_peer_id: peer_id.to_string(),
            resolution: None,
            method: None,
            resolved_at_ms: None,
        }
    }

    fn auto_resolution(&self, peer_id: Uuid, record: &ConflictRecord) -> Option<ConflictResolution> {
        let config = self.config.read().unwrap();
        let policy = config
            .trusted_peers
            .iter()
            .find(|t| t.peer_id == peer_id)
            .and_then(|t| t.auto_resolve)?;
        decide_auto(policy, record)
    }

    /// Surface a conflict to the resolver collaborator without blocking the
    /// planner; the decision comes back as an engine command.
    async fn open_conflict(&self, state: &mut EngineState, peer_id: Uuid, record: ConflictRecord) {
        let key = (peer_id, record.relative_path.clone());
        if state.awaiting_resolution.contains_key(&key) {
            return;
        }
        self.log_activity(
            ActivityEntry::new(ActivityKind::ConflictDetected, ActivitySeverity::Warning, "divergent edit")
                .with_path(record.relative_path.clone())
                .with_peer(record.source_peer_id.clone()),
        );
        state
            .awaiting_resolution
            .insert(key, PendingConflict { record: record.clone(), ready: None });

        let resolver = self.resolver.clone();
        let events = self.events.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            // Event subscribers get first say through the responder; the
            // installed resolver answers when nobody does.
            let (respond_tx, mut respond_rx) = mpsc::channel(1);
            events.emit(SyncEvent::ConflictDetected { record: record.clone(), respond: respond_tx });
            let resolution = tokio::select! {
                Some(answer) = respond_rx.recv() => answer,
                answer = resolver.resolve(&record) => answer,
            };
            let _ = cmd_tx
                .send(EngineCommand::ConflictDecided {
                    peer_id,
                    relative_path: record.relative_path,
                    resolution,
                    method: ResolutionMethod::User,
                })
                .await;
        });
    }

    async fn disposition_for(
        &self,
        peer_id: Uuid,
        record: &ConflictRecord,
        resolution: ConflictResolution,
    ) -> Disposition {
        match resolution {
            ConflictResolution::KeepRemote => Disposition::Apply,
            ConflictResolution::KeepBoth => {
                let peer_name = self
                    .peer_table
                    .get(&peer_id)
                    .map(|p| p.name)
                    .unwrap_or_else(|| peer_id.to_string());
                Disposition::ConflictCopy(keep_both_name(
                    &record.relative_path,
                    &peer_name,
                    record.remote_modified_ms,
                ))
            }
            ConflictResolution::KeepLocal => {
                // Our version wins; push it back at the sender.
                if let Some(local) = self.store.get(&record.relative_path) {
                    if let Some(session) = self.transport.session(&peer_id) {
                        self.spawn_send_file(session, local, 0);
                    }
                }
                Disposition::Discard
            }
            ConflictResolution::Skip => Disposition::Discard,
        }
    }

    fn handle_file_chunk(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        chunk: FileChunkPayload,
    ) -> SyncResult<()> {
        let Some(incoming) = state.incoming.get_mut(&chunk.transfer_id) else {
            return Err(SyncError::Protocol(format!(
                "chunk for unknown transfer {}",
                chunk.transfer_id
            )));
        };
        if incoming.peer_id != peer_id {
            return Err(SyncError::Protocol("chunk from wrong peer".to_string()));
        }
        let checkpointed = incoming.write_chunk(&self.store, &chunk)?;
        if checkpointed {
            transfer::emit_progress(
                &self.events,
                &incoming.relative_path,
                peer_id,
                incoming.bytes_received,
                incoming.total_bytes,
            );
        }
        Ok(())
    }

    async fn handle_file_end(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        end: FileEndPayload,
    ) -> SyncResult<()> {
        let Some(incoming) = state.incoming.remove(&end.transfer_id) else {
            return Err(SyncError::Protocol(format!(
                "end for unknown transfer {}",
                end.transfer_id
            )));
        };
        let disposition = state
            .dispositions
            .remove(&end.transfer_id)
            .unwrap_or(Disposition::Apply);
        let original_path = incoming.relative_path.clone();

        match disposition {
            Disposition::Discard => {
                let temp = incoming.temp_path().to_path_buf();
                drop(incoming);
                let _ = std::fs::remove_file(temp);
                let _ = self.store.remove_checkpoint(&original_path, &peer_id.to_string());
                Ok(())
            }
            Disposition::Apply => {
                self.snapshot(&original_path, SnapshotReason::Update);
                let applied = incoming.finish(&self.store, &self.sync_root, &end).await?;
                self.commit_applied(peer_id, applied, FileAction::Update).await
            }
            Disposition::ConflictCopy(conflict_path) => {
                let mut incoming = incoming;
                incoming.retarget(conflict_path.clone());
                let mut applied = incoming.finish(&self.store, &self.sync_root, &end).await?;
                applied.action = FileAction::Create;
                self.commit_applied(peer_id, applied.clone(), FileAction::Create).await?;
                // The conflict copy is new local content for everyone else.
                Box::pin(self.broadcast_change(state, applied, false)).await;
                Ok(())
            }
            Disposition::AwaitingResolution => {
                let (temp, draft) = incoming.finish_detached(&self.store, &end)?;
                if let Some(pending) =
                    state.awaiting_resolution.get_mut(&(peer_id, original_path.clone()))
                {
                    pending.ready = Some((temp, draft));
                } else {
                    // Resolution already arrived and was applied from the
                    // command path; nothing left to hold.
                    let _ = std::fs::remove_file(temp);
                }
                Ok(())
            }
        }
    }

    async fn commit_applied(
        &self,
        peer_id: Uuid,
        applied: SyncedFile,
        action: FileAction,
    ) -> SyncResult<()> {
        let mut record = applied;
        record.action = action;
        record.source_peer_id = peer_id.to_string();
        self.store.add_or_update(&record)?;
        self.events.emit(SyncEvent::TransferCompleted {
            relative_path: record.relative_path.clone(),
            peer_id,
        });
        self.log_activity(
            ActivityEntry::new(ActivityKind::TransferCompleted, ActivitySeverity::Info, "received file")
                .with_path(record.relative_path.clone())
                .with_peer(record.source_peer_id.clone()),
        );
        Ok(())
    }

    async fn handle_remote_delete(&self, peer_id: Uuid, remote: SyncedFile) -> SyncResult<()> {
        let rel = remote.relative_path.clone();
        let Some(repo) = self.store.get(&rel) else { return Ok(()) };
        if repo.action == FileAction::Delete {
            return Ok(());
        }
        // A locally diverged file survives a remote delete; push our copy
        // back instead.
        if let Some(disk) = self.disk_hash(&rel).await? {
            if disk != repo.content_hash {
                if let Some(session) = self.transport.session(&peer_id) {
                    if let Some(local) = self.store.get(&rel) {
                        self.spawn_send_file(session, local, 0);
                    }
                }
                return Ok(());
            }
        }
        self.snapshot(&rel, SnapshotReason::Delete);
        let abs = self.sync_root.join(&rel);
        if abs.is_file() {
            transfer::retry_io(move || std::fs::remove_file(&abs)).await?;
        } else if abs.is_dir() {
            let _ = std::fs::remove_dir_all(&abs);
        }
        let mut tombstone = remote;
        tombstone.source_peer_id = peer_id.to_string();
        tombstone.action = FileAction::Delete;
        self.store.add_or_update(&tombstone)?;
        self.log_activity(
            ActivityEntry::new(ActivityKind::FileDeleted, ActivitySeverity::Info, "remote delete")
                .with_path(rel)
                .with_peer(peer_id.to_string()),
        );
        Ok(())
    }

    async fn handle_remote_rename(&self, peer_id: Uuid, remote: SyncedFile) -> SyncResult<()> {
        let Some(old_rel) = remote.old_relative_path.clone() else {
            return Err(SyncError::Protocol("rename frame without old path".to_string()));
        };
        let old_abs = self.sync_root.join(&old_rel);
        if !old_abs.exists() {
            // Nothing to rename locally; fetch the content instead.
            return self.request_file(peer_id, &remote.relative_path).await;
        }
        self.snapshot(&old_rel, SnapshotReason::Rename);
        let new_abs = self.sync_root.join(&remote.relative_path);
        if let Some(parent) = new_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        transfer::retry_io(move || std::fs::rename(&old_abs, &new_abs)).await?;
        self.store.remove(&old_rel)?;
        let mut record = remote;
        record.source_peer_id = peer_id.to_string();
        self.store.add_or_update(&record)?;
        self.log_activity(
            ActivityEntry::new(ActivityKind::FileRenamed, ActivitySeverity::Info, "remote rename")
                .with_path(record.relative_path.clone())
                .with_peer(peer_id.to_string()),
        );
        Ok(())
    }

    fn handle_remote_directory(&self, peer_id: Uuid, remote: SyncedFile) -> SyncResult<()> {
        if !remote.is_directory {
            return Err(SyncError::Protocol("directory frame for a file".to_string()));
        }
        std::fs::create_dir_all(self.sync_root.join(&remote.relative_path))?;
        let mut record = remote;
        record.source_peer_id = peer_id.to_string();
        self.store.add_or_update(&record)?;
        Ok(())
    }

    /// The peer wants our block signatures for a path: over the partial temp
    /// file when an incomplete incoming checkpoint exists (resume), else
    /// over the file on disk. An empty signature list tells the sender to
    /// fall back to a full body.
    async fn handle_signatures_request(
        &self,
        peer_id: Uuid,
        request: SignaturesRequestPayload,
    ) -> SyncResult<()> {
        let Some(session) = self.transport.session(&peer_id) else { return Ok(()) };
        let base: PathBuf = match self
            .store
            .get_checkpoint(&request.relative_path, &peer_id.to_string())?
        {
            Some(cp)
                if cp.direction == TransferDirection::Incoming
                    && !cp.completed
                    && Path::new(&cp.temp_file_path).exists() =>
            {
                PathBuf::from(cp.temp_file_path)
            }
            _ => self.sync_root.join(&request.relative_path),
        };

        let signatures = if base.is_file() {
            let permit = self.hash_pool.clone().acquire_owned().await;
            let path = base.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let file = std::fs::File::open(&path)?;
                delta::compute_signatures(std::io::BufReader::new(file))
            })
            .await
            .map_err(|e| SyncError::Io(format!("signature worker failed: {}", e)))??
        } else {
            Vec::new()
        };

        let payload = SignaturesPayload {
            relative_path: request.relative_path,
            block_size: BLOCK_SIZE as u32,
            signatures,
        };
        session.send(FrameKind::Signatures, encode_payload(&payload)?).await
    }

    async fn handle_signatures(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        signatures: SignaturesPayload,
    ) -> SyncResult<()> {
        let Some(pending) = state
            .pending_deltas
            .remove(&(peer_id, signatures.relative_path.clone()))
        else {
            return Ok(());
        };
        let Some(session) = self.transport.session(&peer_id) else { return Ok(()) };

        // Mismatched block size or an empty base degrades to a full send.
        if signatures.block_size as usize != BLOCK_SIZE || signatures.signatures.is_empty() {
            self.spawn_send_file(session, pending.state, 0);
            return Ok(());
        }

        let path = self.sync_root.join(&pending.state.relative_path);
        let permit = self.hash_pool.clone().acquire_owned().await;
        let sigs = signatures.signatures;
        let instructions = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let target = std::fs::read(&path)?;
            Ok::<_, SyncError>(delta::compute_delta(&target, &sigs))
        })
        .await
        .map_err(|e| SyncError::Io(format!("delta worker failed: {}", e)))??;

        let payload = DeltaPayload { state: pending.state.clone(), instructions };
        session.send(FrameKind::DeltaData, encode_payload(&payload)?).await?;
        self.log_activity(
            ActivityEntry::new(ActivityKind::TransferCompleted, ActivitySeverity::Info, "sent delta update")
                .with_path(pending.state.relative_path)
                .with_peer(peer_id.to_string()),
        );
        Ok(())
    }

    async fn handle_delta_data(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        delta_payload: DeltaPayload,
    ) -> SyncResult<()> {
        let rel = delta_payload.state.relative_path.clone();
        // Base: a checkpointed partial when resuming, the live file otherwise.
        let base = match self.store.get_checkpoint(&rel, &peer_id.to_string())? {
            Some(cp)
                if cp.direction == TransferDirection::Incoming
                    && Path::new(&cp.temp_file_path).exists() =>
            {
                PathBuf::from(cp.temp_file_path)
            }
            _ => self.sync_root.join(&rel),
        };

        let base_is_partial = base != self.sync_root.join(&rel);
        let expected = delta_payload.state.content_hash.clone();
        let out_path = transfer::temp_path_for(&self.sync_root, &rel, &Uuid::new_v4());
        let permit = self.hash_pool.clone().acquire_owned().await;
        let instructions = delta_payload.instructions;
        let base_for_worker = base.clone();
        let out_for_worker = out_path.clone();
        let reconstructed = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut base_file = std::fs::File::open(&base_for_worker)?;
            let mut out = std::fs::File::create(&out_for_worker)?;
            let (total, hash) = delta::apply_delta(&mut base_file, &instructions, &mut out)?;
            out.sync_all()?;
            Ok::<_, SyncError>((total, hash))
        })
        .await
        .map_err(|e| SyncError::Io(format!("reconstruction worker failed: {}", e)))?;

        let (total, actual) = match reconstructed {
            Ok(result) => result,
            Err(e) => {
                let _ = std::fs::remove_file(&out_path);
                return Err(e);
            }
        };
        if actual != expected {
            let _ = std::fs::remove_file(&out_path);
            self.log_activity(
                ActivityEntry::new(ActivityKind::TransferFailed, ActivitySeverity::Error, "delta hash mismatch")
                    .with_path(rel.clone())
                    .with_peer(peer_id.to_string()),
            );
            return Err(SyncError::HashMismatch { path: rel, expected, actual });
        }

        // Conflict detection runs against the reconstructed content exactly
        // as it would for a full body.
        let repo = self.store.get(&rel);
        let disk_hash = self.disk_hash(&rel).await?;
        let class = classify_incoming(
            repo.as_ref().map(|r| r.content_hash.as_str()),
            disk_hash.as_deref(),
            &expected,
        );
        match class {
            IncomingClass::InSync => {
                let _ = std::fs::remove_file(&out_path);
                return Ok(());
            }
            IncomingClass::Conflict => {
                let record =
                    self.build_conflict_record(&delta_payload.state, repo.as_ref(), disk_hash, peer_id);
                match self.auto_resolution(peer_id, &record) {
                    Some(resolution) => {
                        self.record_resolution(&record, resolution, ResolutionMethod::Auto);
                        match self.disposition_for(peer_id, &record, resolution).await {
                            Disposition::Apply => {}
                            Disposition::ConflictCopy(conflict_path) => {
                                let result = self
                                    .apply_reconstructed(peer_id, &delta_payload.state, out_path, total, conflict_path, FileAction::Create)
                                    .await;
                                if result.is_ok() && base_is_partial {
                                    let _ = std::fs::remove_file(&base);
                                }
                                return result;
                            }
                            _ => {
                                let _ = std::fs::remove_file(&out_path);
                                return Ok(());
                            }
                        }
                    }
                    None => {
                        let key = (peer_id, rel.clone());
                        let mut draft = delta_payload.state.clone();
                        draft.size = total;
                        self.open_conflict(state, peer_id, record).await;
                        if let Some(pending) = state.awaiting_resolution.get_mut(&key) {
                            pending.ready = Some((out_path, draft));
                        }
                        return Ok(());
                    }
                }
            }
            IncomingClass::Accept => {}
        }

        self.snapshot(&rel, SnapshotReason::Update);
        self.apply_reconstructed(peer_id, &delta_payload.state, out_path, total, rel, FileAction::Update)
            .await?;
        // A checkpointed partial served as the base; it is spent now.
        if base_is_partial {
            let _ = std::fs::remove_file(&base);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_reconstructed(
        &self,
        peer_id: Uuid,
        remote: &SyncedFile,
        temp: PathBuf,
        total: u64,
        target_rel: String,
        action: FileAction,
    ) -> SyncResult<()> {
        let target = self.sync_root.join(&target_rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest = target.clone();
        transfer::retry_io(move || std::fs::rename(&temp, &dest)).await?;
        let _ = self.store.remove_checkpoint(&target_rel, &peer_id.to_string());

        let record = SyncedFile {
            relative_path: target_rel,
            content_hash: remote.content_hash.clone(),
            size: total,
            last_modified_ms: remote.last_modified_ms,
            action,
            source_peer_id: peer_id.to_string(),
            is_directory: false,
            old_relative_path: None,
        };
        self.store.add_or_update(&record)?;
        self.events.emit(SyncEvent::TransferCompleted {
            relative_path: record.relative_path.clone(),
            peer_id,
        });
        self.log_activity(
            ActivityEntry::new(ActivityKind::TransferCompleted, ActivitySeverity::Info, "applied delta update")
                .with_path(record.relative_path.clone())
                .with_peer(peer_id.to_string()),
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------

    async fn handle_command(&self, state: &mut EngineState, command: EngineCommand) {
        match command {
            EngineCommand::FinalizeDelete { relative_path, content_hash } => {
                // Still pending means no create claimed it: a real delete.
                let still_pending = state
                    .pending_deletes
                    .get(&content_hash)
                    .map(|p| p.state.relative_path == relative_path)
                    .unwrap_or(false);
                if still_pending {
                    if let Some(pending) = state.pending_deletes.remove(&content_hash) {
                        if let Err(e) = self.finalize_local_delete(state, pending.state).await {
                            tracing::warn!(target: "swarm::engine", "delete of {} failed: {}", relative_path, e);
                        }
                    }
                }
            }
            EngineCommand::ConflictDecided { peer_id, relative_path, resolution, method } => {
                if let Err(e) = self
                    .apply_conflict_decision(state, peer_id, relative_path, resolution, method)
                    .await
                {
                    tracing::warn!(target: "swarm::engine", "conflict resolution failed: {}", e);
                }
            }
        }
    }

    async fn apply_conflict_decision(
        &self,
        state: &mut EngineState,
        peer_id: Uuid,
        relative_path: String,
        resolution: ConflictResolution,
        method: ResolutionMethod,
    ) -> SyncResult<()> {
        let Some(pending) = state.awaiting_resolution.remove(&(peer_id, relative_path.clone()))
        else {
            return Ok(());
        };
        self.record_resolution(&pending.record, resolution, method);

        let Some((temp, draft)) = pending.ready else {
            // The body never finished (or the change came via manifest and
            // was never transferred). Re-request it when the remote side
            // should win; otherwise there is nothing to do.
            if matches!(resolution, ConflictResolution::KeepRemote | ConflictResolution::KeepBoth) {
                return self.request_file(peer_id, &relative_path).await;
            }
            if resolution == ConflictResolution::KeepLocal {
                if let (Some(session), Some(local)) =
                    (self.transport.session(&peer_id), self.store.get(&relative_path))
                {
                    self.spawn_send_file(session, local, 0);
                }
            }
            return Ok(());
        };

        match resolution {
            ConflictResolution::KeepRemote => {
                self.snapshot(&relative_path, SnapshotReason::ConflictResolution);
                let total = draft.size;
                self.apply_reconstructed(peer_id, &draft, temp, total, relative_path, FileAction::Update)
                    .await
            }
            ConflictResolution::KeepBoth => {
                let peer_name = self
                    .peer_table
                    .get(&peer_id)
                    .map(|p| p.name)
                    .unwrap_or_else(|| peer_id.to_string());
                let conflict_path =
                    keep_both_name(&relative_path, &peer_name, draft.last_modified_ms);
                let total = draft.size;
                self.apply_reconstructed(peer_id, &draft, temp, total, conflict_path.clone(), FileAction::Create)
                    .await?;
                if let Some(record) = self.store.get(&conflict_path) {
                    Box::pin(self.broadcast_change(state, record, false)).await;
                }
                Ok(())
            }
            ConflictResolution::KeepLocal => {
                let _ = std::fs::remove_file(temp);
                if let (Some(session), Some(local)) =
                    (self.transport.session(&peer_id), self.store.get(&relative_path))
                {
                    self.spawn_send_file(session, local, 0);
                }
                Ok(())
            }
            ConflictResolution::Skip => {
                let _ = std::fs::remove_file(temp);
                Ok(())
            }
        }
    }

    fn record_resolution(
        &self,
        record: &ConflictRecord,
        resolution: ConflictResolution,
        method: ResolutionMethod,
    ) {
        let mut resolved = record.clone();
        resolved.resolve(resolution, method);
        let details = serde_json::to_string(&resolved).unwrap_or_default();
        self.log_activity(
            ActivityEntry::new(ActivityKind::ConflictResolved, ActivitySeverity::Info, format!("{:?}", resolution))
                .with_path(record.relative_path.clone())
                .with_peer(record.source_peer_id.clone())
                .with_details(details),
        );
    }

    /// Drop delta requests whose signatures never arrived and send the full
    /// body instead.
    async fn expire_pending_deltas(&self, state: &mut EngineState) {
        let now = now_ms();
        let expired: Vec<(Uuid, String)> = state
            .pending_deltas
            .iter()
            .filter(|(_, p)| now - p.requested_at_ms > SIGNATURES_TIMEOUT_MS)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(pending) = state.pending_deltas.remove(&key) {
                tracing::info!(
                    target: "swarm::engine",
                    "signatures for {} timed out; sending full body", pending.state.relative_path
                );
                if let Some(session) = self.transport.session(&key.0) {
                    self.spawn_send_file(session, pending.state, 0);
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Rescan
    // -------------------------------------------------------------------

    /// Walk the sync folder and emit synthetic events for drift between the
    /// disk and the repository. Hashing happens in the local pipeline, so
    /// this pass only compares cheap metadata.
    pub async fn rescan(&self, state: &mut EngineState) -> SyncResult<()> {
        let sync_root = self.sync_root.clone();
        let ignore = self.ignore.clone();
        let known = self.store.snapshot();
        let events = tokio::task::spawn_blocking(move || scan_for_drift(&sync_root, &ignore, &known))
            .await
            .map_err(|e| SyncError::Io(format!("rescan worker failed: {}", e)))??;

        if !events.is_empty() {
            tracing::info!(target: "swarm::engine", "rescan found {} drifted paths", events.len());
            self.log_activity(ActivityEntry::new(
                ActivityKind::Rescan,
                ActivitySeverity::Info,
                format!("rescan found {} drifted paths", events.len()),
            ));
        }
        for event in events {
            if let Err(e) = Box::pin(self.handle_watch_event(state, event)).await {
                tracing::warn!(target: "swarm::engine", "rescan apply failed: {}", e);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    async fn hash_file(&self, abs: &Path) -> SyncResult<String> {
        let permit = self.hash_pool.clone().acquire_owned().await;
        let path = abs.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            crypto::sha256_file(&path)
        })
        .await
        .map_err(|e| SyncError::Io(format!("hash worker failed: {}", e)))?
    }

    /// Hash of the file currently on disk, or None when absent.
    async fn disk_hash(&self, rel: &str) -> SyncResult<Option<String>> {
        let abs = self.sync_root.join(rel);
        if !abs.is_file() {
            return Ok(None);
        }
        Ok(Some(self.hash_file(&abs).await?))
    }

    fn snapshot(&self, rel: &str, reason: SnapshotReason) {
        if let Err(e) = self.versions.snapshot(rel, reason) {
            tracing::warn!(target: "swarm::engine", "version snapshot of {} failed: {}", rel, e);
        }
    }

    fn log_activity(&self, entry: ActivityEntry) {
        let entry = self.activity.append(entry);
        self.events.emit(SyncEvent::ActivityAppended(entry));
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => futures::future::pending().await,
    }
}

fn file_mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(now_ms)
}

fn local_activity_kind(action: FileAction) -> ActivityKind {
    match action {
        FileAction::Create => ActivityKind::FileCreated,
        FileAction::Update => ActivityKind::FileUpdated,
        FileAction::Delete => ActivityKind::FileDeleted,
        FileAction::Rename => ActivityKind::FileRenamed,
    }
}

/// Compare the tree on disk with the repository snapshot and produce
/// synthetic watch events for drift. Cheap metadata comparison only; the
/// pipeline re-hashes anything surfaced here.
fn scan_for_drift(
    sync_root: &Path,
    ignore: &IgnoreMatcher,
    known: &[SyncedFile],
) -> SyncResult<Vec<WatchEvent>> {
    let mut events = Vec::new();
    let mut seen: HashMap<String, ()> = HashMap::new();
    let by_path: HashMap<&str, &SyncedFile> =
        known.iter().map(|s| (s.relative_path.as_str(), s)).collect();

    for entry in walkdir::WalkDir::new(sync_root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(target: "swarm::engine", "rescan skipping unreadable entry: {}", e);
                continue;
            }
        };
        let Some(rel) = entry
            .path()
            .strip_prefix(sync_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
        else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        if ignore.is_ignored(&rel, is_dir) {
            continue;
        }
        seen.insert(rel.clone(), ());
        if is_dir {
            if !by_path.contains_key(rel.as_str()) {
                events.push(WatchEvent { relative_path: rel, kind: WatchKind::Created });
            }
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        match by_path.get(rel.as_str()) {
            None => events.push(WatchEvent { relative_path: rel, kind: WatchKind::Created }),
            Some(record) if record.action == FileAction::Delete => {
                events.push(WatchEvent { relative_path: rel, kind: WatchKind::Created });
            }
            Some(record) => {
                let size_differs = record.size != metadata.len();
                let mtime_differs = (file_mtime_ms(&metadata) - record.last_modified_ms).abs() > 1_000;
                if size_differs || mtime_differs {
                    events.push(WatchEvent { relative_path: rel, kind: WatchKind::Modified });
                }
            }
        }
    }

    for record in known {
        if record.action == FileAction::Delete || record.is_directory {
            continue;
        }
        if !seen.contains_key(&record.relative_path) {
            events.push(WatchEvent {
                relative_path: record.relative_path.clone(),
                kind: WatchKind::Removed,
            });
        }
    }
    Ok(events)
}
