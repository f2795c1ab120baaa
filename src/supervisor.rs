/// Supervisor Module
///
/// Explicit wiring of every component: no container, no reflection, just
/// construction in dependency order. Startup: state store → identity →
/// transport listener → discovery → watcher → engine → vault auto-lock.
/// Shutdown walks the same list in reverse behind a single watch-channel
/// signal, then flushes the store.
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog, ActivitySeverity, DEFAULT_CAPACITY};
use crate::config::{default_keys_dir, Config};
use crate::conflict::ConflictResolver;
use crate::crypto;
use crate::discovery::{Beacon, BeaconSource, Discovery, DiscoveryHandle};
use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::ignore::IgnoreMatcher;
use crate::key_storage::{load_or_create_identity, FileKeyStorage};
use crate::peer::PeerTable;
use crate::power::PowerStatus;
use crate::state_store::{default_db_path, StateStore};
use crate::sync_engine::SyncEngine;
use crate::transport::{LocalIdentity, Transport, TransportEvent, INBOUND_QUEUE_FRAMES};
use crate::vault::VaultManager;
use crate::versioning::VersionStore;
use crate::watcher::FsWatcher;

/// Vault auto-lock sweep period.
const AUTOLOCK_TICK: Duration = Duration::from_secs(60);

/// Advertises the live daemon state in beacons.
struct LiveBeacon {
    config: Arc<RwLock<Config>>,
    identity_public_hex: String,
    transfer_port: u16,
    store: Arc<StateStore>,
}

impl BeaconSource for LiveBeacon {
    fn current_beacon(&self) -> Beacon {
        let config = self.config.read().unwrap();
        Beacon {
            peer_id: config.local_id,
            peer_name: config.device_name.clone(),
            transfer_port: self.transfer_port,
            identity_public_key: self.identity_public_hex.clone(),
            sync_enabled: config.sync_enabled,
            manifest_hash: Some(manifest_hash(&self.store)),
        }
    }
}

/// Order-independent digest of the tracked state, advertised so peers can
/// skip a session when nothing changed.
fn manifest_hash(store: &StateStore) -> String {
    let mut entries: Vec<String> = store
        .snapshot()
        .iter()
        .map(|s| format!("{}:{}", s.relative_path, s.content_hash))
        .collect();
    entries.sort();
    crypto::sha256_hex(entries.join("\n").as_bytes())
}

/// The running daemon. Dropping it does not stop the tasks; call
/// `shutdown` for an orderly exit.
pub struct Supervisor {
    pub config: Arc<RwLock<Config>>,
    pub events: EventBus,
    pub store: Arc<StateStore>,
    pub vault: Arc<VaultManager>,
    pub peer_table: Arc<PeerTable>,
    pub transfer_port: u16,
    shutdown_tx: watch::Sender<bool>,
    discovery: DiscoveryHandle,
    accept_task: JoinHandle<()>,
    engine_task: JoinHandle<()>,
    autolock_task: JoinHandle<()>,
    _watcher: FsWatcher,
}

impl Supervisor {
    /// Construct and start every component of the daemon.
    pub async fn start(
        config: Config,
        power: Arc<dyn PowerStatus>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> SyncResult<Self> {
        let sync_root = config.sync_folder_path.clone();
        std::fs::create_dir_all(&sync_root)?;
        std::fs::create_dir_all(sync_root.join(".swarm"))?;

        let events = EventBus::new();
        let config = Arc::new(RwLock::new(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Durable state first: everything else hangs off it.
        let store = Arc::new(StateStore::open(&default_db_path(&sync_root))?);

        // Identity key, persisted through the key-storage interface.
        let key_storage = FileKeyStorage::new(default_keys_dir()?);
        let identity = Arc::new(load_or_create_identity(&key_storage)?);

        let peer_table = Arc::new(PeerTable::new());
        let activity = Arc::new(ActivityLog::open(
            Some(sync_root.join(".swarm").join("activity.log")),
            DEFAULT_CAPACITY,
        ));
        let versions = Arc::new(VersionStore::new(&sync_root));
        let ignore = Arc::new(IgnoreMatcher::new(
            &sync_root,
            config.read().unwrap().excluded_folders.clone(),
        ));

        let auto_lock_minutes = config.read().unwrap().encryption_auto_lock_minutes;
        let vault = Arc::new(VaultManager::new(&sync_root, auto_lock_minutes));
        for folder in config.read().unwrap().encrypted_folders.clone() {
            if let Err(e) = vault.register(&folder) {
                tracing::warn!(target: "swarm::vault", "cannot register vault {}: {}", folder, e);
            }
        }

        // Transport listener on the first free port of the range.
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(INBOUND_QUEUE_FRAMES);
        let (port_start, port_end, discovery_port, local_id, device_name) = {
            let c = config.read().unwrap();
            (
                c.network.transfer_port_start,
                c.network.transfer_port_end,
                c.network.discovery_port,
                c.local_id,
                c.device_name.clone(),
            )
        };
        let transport = Transport::new(
            LocalIdentity { id: local_id, device_name, keypair: identity.clone() },
            config.clone(),
            inbound_tx,
            shutdown_rx.clone(),
        );
        let (listener, transfer_port) = Transport::bind_listener(port_start, port_end).await?;
        let accept_task = transport.start_accepting(listener);

        // Discovery announces the chosen port.
        let discovery = Discovery {
            local_id,
            port: discovery_port,
            source: Arc::new(LiveBeacon {
                config: config.clone(),
                identity_public_hex: hex::encode(identity.public_bytes()),
                transfer_port,
                store: store.clone(),
            }),
            peer_table: peer_table.clone(),
            config: config.clone(),
            events: events.clone(),
        }
        .start(shutdown_rx.clone());

        // Watcher feeds the engine's planner.
        let (watcher, watch_rx) = FsWatcher::start(&sync_root, shutdown_rx.clone())?;

        let engine = SyncEngine::new(
            sync_root,
            local_id,
            config.clone(),
            store.clone(),
            transport,
            peer_table.clone(),
            ignore,
            vault.clone(),
            versions,
            activity.clone(),
            events.clone(),
            power,
            resolver,
        );
        let engine_task = tokio::spawn(engine.run(watch_rx, inbound_rx, shutdown_rx.clone()));

        let autolock_task = tokio::spawn(autolock_loop(
            vault.clone(),
            activity,
            events.clone(),
            shutdown_rx,
        ));

        tracing::info!(
            "daemon up: id {}, transfer port {}, discovery port {}",
            local_id, transfer_port, discovery_port
        );
        Ok(Self {
            config,
            events,
            store,
            vault,
            peer_table,
            transfer_port,
            shutdown_tx,
            discovery,
            accept_task,
            engine_task,
            autolock_task,
            _watcher: watcher,
        })
    }

    /// Signal every task and wait for them in reverse startup order, then
    /// flush the store.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            let _ = self.autolock_task.await;
            let _ = self.engine_task.await;
            self.discovery.join().await;
            let _ = self.accept_task.await;
        };
        if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
            tracing::warn!("shutdown timed out; some tasks were abandoned");
        }
        if let Err(e) = self.store.save_changes() {
            tracing::warn!("final store flush failed: {}", e);
        }
        tracing::info!("daemon stopped");
    }
}

async fn autolock_loop(
    vault: Arc<VaultManager>,
    activity: Arc<ActivityLog>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(AUTOLOCK_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        for folder in vault.auto_lock_tick() {
            activity.append(
                ActivityEntry::new(ActivityKind::VaultLocked, ActivitySeverity::Info, "auto-locked idle vault")
                    .with_path(folder.clone()),
            );
            events.emit(SyncEvent::FolderAutoLocked { folder });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::{FileAction, SyncedFile};

    #[test]
    fn manifest_hash_is_order_independent_and_content_sensitive() {
        let store_a = StateStore::open_in_memory().unwrap();
        let store_b = StateStore::open_in_memory().unwrap();
        let file = |p: &str, h: &str| SyncedFile {
            relative_path: p.to_string(),
            content_hash: h.to_string(),
            size: 1,
            last_modified_ms: 0,
            action: FileAction::Create,
            source_peer_id: String::new(),
            is_directory: false,
            old_relative_path: None,
        };
        store_a.add_or_update(&file("a.txt", "11")).unwrap();
        store_a.add_or_update(&file("b.txt", "22")).unwrap();
        store_b.add_or_update(&file("b.txt", "22")).unwrap();
        store_b.add_or_update(&file("a.txt", "11")).unwrap();
        assert_eq!(manifest_hash(&store_a), manifest_hash(&store_b));

        store_b.add_or_update(&file("a.txt", "33")).unwrap();
        assert_ne!(manifest_hash(&store_a), manifest_hash(&store_b));
    }

    #[tokio::test]
    async fn daemon_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sync_folder_path = dir.path().join("sync");
        // High ports to avoid colliding with other tests
        config.network.transfer_port_start = 54200;
        config.network.transfer_port_end = 54260;
        config.network.discovery_port = 54261;

        let supervisor = Supervisor::start(
            config,
            Arc::new(crate::power::MainsPower),
            Arc::new(crate::conflict::SkipResolver),
        )
        .await
        .unwrap();
        assert!(supervisor.transfer_port >= 54200);
        assert!(dir.path().join("sync/.swarm/state.db").exists());

        supervisor.shutdown().await;
    }
}
