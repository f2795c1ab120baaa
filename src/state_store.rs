/// State Repository Module
///
/// Durable mapping from relative path to file state, plus resumable transfer
/// checkpoints, backed by SQLite in WAL mode. The store keeps an in-memory
/// cache of file states for cheap snapshots; all writes go through a single
/// connection guarded by a mutex so the final state for a given path always
/// reflects the last applied action.
///
/// Failure policy: a failed write returns the error to the caller without
/// partial mutation; a failed read flips the store into a degraded read-only
/// state that is reported upward and blocks further writes.
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{SyncError, SyncResult};

/// What happened to a file, as carried in manifests and change frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    Create,
    Update,
    Delete,
    Rename,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
            FileAction::Delete => "delete",
            FileAction::Rename => "rename",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(FileAction::Create),
            "update" => Ok(FileAction::Update),
            "delete" => Ok(FileAction::Delete),
            "rename" => Ok(FileAction::Rename),
            other => Err(SyncError::StateStore(format!("unknown action: {}", other))),
        }
    }
}

/// Tracked state of one file, keyed by its canonical relative path
/// (forward slashes, case preserved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedFile {
    pub relative_path: String,
    /// SHA-256 of the content, lowercase hex. Empty only for deletes and
    /// directories.
    pub content_hash: String,
    pub size: u64,
    /// Last-modified time, UTC milliseconds.
    pub last_modified_ms: i64,
    pub action: FileAction,
    /// Peer that produced this state; empty for local changes.
    pub source_peer_id: String,
    pub is_directory: bool,
    /// Previous path, set only for renames.
    pub old_relative_path: Option<String>,
}

impl SyncedFile {
    /// Enforce the record invariant: non-directory, non-delete entries carry
    /// a hash.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.is_directory && self.action != FileAction::Delete && self.content_hash.is_empty() {
            return Err(SyncError::StateStore(format!(
                "file state for {} is missing a content hash",
                self.relative_path
            )));
        }
        if self.action == FileAction::Rename && self.old_relative_path.is_none() {
            return Err(SyncError::StateStore(format!(
                "rename state for {} is missing the old path",
                self.relative_path
            )));
        }
        Ok(())
    }
}

/// Direction of an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Durable record of an in-progress transfer, unique per (path, peer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCheckpoint {
    pub relative_path: String,
    pub peer_id: String,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub content_hash: String,
    pub temp_file_path: String,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed: bool,
}

/// Lookup key for a relative path. Case-insensitive filesystems compare
/// case-insensitively while the stored record preserves case.
pub fn path_key(path: &str) -> String {
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}

/// SQLite-backed repository of file states and transfer checkpoints.
pub struct StateStore {
    conn: Mutex<Connection>,
    cache: RwLock<HashMap<String, SyncedFile>>,
    degraded: AtomicBool,
}

impl StateStore {
    /// Open (or create) the store at `db_path` and rehydrate the cache.
    pub fn open(db_path: &Path) -> SyncResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        };
        store.initialize_schema()?;
        store.load()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_states (
                relative_path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                action TEXT NOT NULL,
                source_peer_id TEXT NOT NULL DEFAULT '',
                is_directory INTEGER NOT NULL DEFAULT 0,
                old_relative_path TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_file_states_hash ON file_states(content_hash)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transfer_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                relative_path TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                is_incoming INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                bytes_transferred INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                temp_file_path TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL,
                is_completed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(relative_path, peer_id)
            )",
            [],
        )?;
        Ok(())
    }

    /// Whether a read failure has put the store in read-only mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn mark_degraded<E: std::fmt::Display>(&self, context: &str, e: E) -> SyncError {
        self.degraded.store(true, Ordering::SeqCst);
        tracing::error!(target: "swarm::store", "{}: {}; store is now read-only", context, e);
        SyncError::StateStore(format!("{}: {}", context, e))
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.is_degraded() {
            return Err(SyncError::StateStore(
                "repository is in degraded read-only mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Rehydrate the in-memory cache from disk.
    pub fn load(&self) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT relative_path, content_hash, size, last_modified, action,
                        source_peer_id, is_directory, old_relative_path
                 FROM file_states",
            )
            .map_err(|e| self.mark_degraded("failed to prepare load query", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .map_err(|e| self.mark_degraded("failed to load file states", e))?;

        let mut cache = HashMap::new();
        for row in rows {
            let (path, hash, size, modified, action, peer, is_dir, old_path) =
                row.map_err(|e| self.mark_degraded("failed to read file state row", e))?;
            let state = SyncedFile {
                relative_path: path.clone(),
                content_hash: hash,
                size: size as u64,
                last_modified_ms: modified,
                action: FileAction::parse(&action)?,
                source_peer_id: peer,
                is_directory: is_dir,
                old_relative_path: old_path,
            };
            cache.insert(path_key(&path), state);
        }
        *self.cache.write().unwrap() = cache;
        Ok(())
    }

    /// Get the tracked state for one relative path.
    pub fn get(&self, relative_path: &str) -> Option<SyncedFile> {
        self.cache.read().unwrap().get(&path_key(relative_path)).cloned()
    }

    /// All tracked states, unordered.
    pub fn get_all(&self) -> Vec<SyncedFile> {
        self.cache.read().unwrap().values().cloned().collect()
    }

    /// Consistent read-only view for manifest generation.
    pub fn snapshot(&self) -> Vec<SyncedFile> {
        self.get_all()
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.cache.read().unwrap().contains_key(&path_key(relative_path))
    }

    pub fn count(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Upsert keyed by relative path. The cache and the database move
    /// together; a database failure leaves the cache untouched.
    pub fn add_or_update(&self, state: &SyncedFile) -> SyncResult<()> {
        self.check_writable()?;
        state.validate()?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO file_states
                     (relative_path, content_hash, size, last_modified, action,
                      source_peer_id, is_directory, old_relative_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(relative_path) DO UPDATE SET
                     content_hash = excluded.content_hash,
                     size = excluded.size,
                     last_modified = excluded.last_modified,
                     action = excluded.action,
                     source_peer_id = excluded.source_peer_id,
                     is_directory = excluded.is_directory,
                     old_relative_path = excluded.old_relative_path",
                params![
                    state.relative_path,
                    state.content_hash,
                    state.size as i64,
                    state.last_modified_ms,
                    state.action.as_str(),
                    state.source_peer_id,
                    state.is_directory,
                    state.old_relative_path,
                ],
            )?;
        }
        self.cache
            .write()
            .unwrap()
            .insert(path_key(&state.relative_path), state.clone());
        Ok(())
    }

    /// Remove a tracked path. Idempotent.
    pub fn remove(&self, relative_path: &str) -> SyncResult<()> {
        self.check_writable()?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM file_states WHERE relative_path = ?1",
                params![relative_path],
            )?;
        }
        self.cache.write().unwrap().remove(&path_key(relative_path));
        Ok(())
    }

    /// Drop every tracked state and checkpoint.
    pub fn clear(&self) -> SyncResult<()> {
        self.check_writable()?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM file_states", [])?;
            conn.execute("DELETE FROM transfer_checkpoints", [])?;
        }
        self.cache.write().unwrap().clear();
        Ok(())
    }

    /// Flush WAL contents into the main database file.
    pub fn save_changes(&self) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transfer checkpoints
    // -----------------------------------------------------------------------

    /// Insert or refresh the checkpoint for (path, peer).
    pub fn upsert_checkpoint(&self, cp: &TransferCheckpoint) -> SyncResult<()> {
        self.check_writable()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transfer_checkpoints
                 (relative_path, peer_id, is_incoming, total_bytes, bytes_transferred,
                  content_hash, temp_file_path, started_at, last_updated_at, is_completed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(relative_path, peer_id) DO UPDATE SET
                 is_incoming = excluded.is_incoming,
                 total_bytes = excluded.total_bytes,
                 bytes_transferred = excluded.bytes_transferred,
                 content_hash = excluded.content_hash,
                 temp_file_path = excluded.temp_file_path,
                 last_updated_at = excluded.last_updated_at,
                 is_completed = excluded.is_completed",
            params![
                cp.relative_path,
                cp.peer_id,
                cp.direction == TransferDirection::Incoming,
                cp.total_bytes as i64,
                cp.bytes_transferred as i64,
                cp.content_hash,
                cp.temp_file_path,
                cp.started_at_ms,
                cp.updated_at_ms,
                cp.completed,
            ],
        )?;
        Ok(())
    }

    /// Look up the checkpoint for (path, peer).
    pub fn get_checkpoint(
        &self,
        relative_path: &str,
        peer_id: &str,
    ) -> SyncResult<Option<TransferCheckpoint>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT relative_path, peer_id, is_incoming, total_bytes, bytes_transferred,
                        content_hash, temp_file_path, started_at, last_updated_at, is_completed
                 FROM transfer_checkpoints
                 WHERE relative_path = ?1 AND peer_id = ?2",
                params![relative_path, peer_id],
                Self::row_to_checkpoint,
            )
            .optional();
        match result {
            Ok(cp) => Ok(cp),
            Err(e) => Err(self.mark_degraded("checkpoint lookup failed", e)),
        }
    }

    /// All incomplete checkpoints involving a peer, used on session
    /// re-establishment to resume transfers.
    pub fn incomplete_checkpoints_for_peer(
        &self,
        peer_id: &str,
    ) -> SyncResult<Vec<TransferCheckpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT relative_path, peer_id, is_incoming, total_bytes, bytes_transferred,
                    content_hash, temp_file_path, started_at, last_updated_at, is_completed
             FROM transfer_checkpoints
             WHERE peer_id = ?1 AND is_completed = 0",
        )?;
        let rows = stmt.query_map(params![peer_id], Self::row_to_checkpoint)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete the checkpoint for (path, peer). Idempotent.
    pub fn remove_checkpoint(&self, relative_path: &str, peer_id: &str) -> SyncResult<()> {
        self.check_writable()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM transfer_checkpoints WHERE relative_path = ?1 AND peer_id = ?2",
            params![relative_path, peer_id],
        )?;
        Ok(())
    }

    fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<TransferCheckpoint, rusqlite::Error> {
        let is_incoming: bool = row.get(2)?;
        Ok(TransferCheckpoint {
            relative_path: row.get(0)?,
            peer_id: row.get(1)?,
            direction: if is_incoming {
                TransferDirection::Incoming
            } else {
                TransferDirection::Outgoing
            },
            total_bytes: row.get::<_, i64>(3)? as u64,
            bytes_transferred: row.get::<_, i64>(4)? as u64,
            content_hash: row.get(5)?,
            temp_file_path: row.get(6)?,
            started_at_ms: row.get(7)?,
            updated_at_ms: row.get(8)?,
            completed: row.get(9)?,
        })
    }
}

/// Default database location under the sync root.
pub fn default_db_path(sync_root: &Path) -> PathBuf {
    sync_root.join(".swarm").join("state.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(path: &str, hash: &str) -> SyncedFile {
        SyncedFile {
            relative_path: path.to_string(),
            content_hash: hash.to_string(),
            size: 3,
            last_modified_ms: 1_700_000_000_000,
            action: FileAction::Create,
            source_peer_id: String::new(),
            is_directory: false,
            old_relative_path: None,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let state = sample("docs/hello.txt", "aa");
        store.add_or_update(&state).unwrap();
        store.add_or_update(&state).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.get("docs/hello.txt").unwrap(), state);
    }

    #[test]
    fn upsert_replaces_by_path() {
        let store = StateStore::open_in_memory().unwrap();
        store.add_or_update(&sample("a.txt", "aa")).unwrap();
        let mut updated = sample("a.txt", "bb");
        updated.action = FileAction::Update;
        updated.size = 9;
        store.add_or_update(&updated).unwrap();

        let got = store.get("a.txt").unwrap();
        assert_eq!(got.content_hash, "bb");
        assert_eq!(got.size, 9);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.add_or_update(&sample("a.txt", "aa")).unwrap();
        store.remove("a.txt").unwrap();
        store.remove("a.txt").unwrap();
        assert!(!store.exists("a.txt"));
    }

    #[test]
    fn missing_hash_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut bad = sample("a.txt", "");
        bad.action = FileAction::Update;
        assert!(store.add_or_update(&bad).is_err());

        // Deletes may carry an empty hash
        let mut del = sample("a.txt", "");
        del.action = FileAction::Delete;
        store.add_or_update(&del).unwrap();
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        {
            let store = StateStore::open(&db).unwrap();
            store.add_or_update(&sample("kept.txt", "cc")).unwrap();
        }
        let store = StateStore::open(&db).unwrap();
        assert_eq!(store.get("kept.txt").unwrap().content_hash, "cc");
    }

    #[test]
    fn checkpoint_unique_per_path_and_peer() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cp = TransferCheckpoint {
            relative_path: "big.bin".to_string(),
            peer_id: "peer-1".to_string(),
            direction: TransferDirection::Incoming,
            total_bytes: 500,
            bytes_transferred: 100,
            content_hash: "dd".to_string(),
            temp_file_path: "/tmp/big.part".to_string(),
            started_at_ms: 1,
            updated_at_ms: 2,
            completed: false,
        };
        store.upsert_checkpoint(&cp).unwrap();
        cp.bytes_transferred = 250;
        cp.updated_at_ms = 3;
        store.upsert_checkpoint(&cp).unwrap();

        let got = store.get_checkpoint("big.bin", "peer-1").unwrap().unwrap();
        assert_eq!(got.bytes_transferred, 250);

        let open = store.incomplete_checkpoints_for_peer("peer-1").unwrap();
        assert_eq!(open.len(), 1);

        cp.completed = true;
        store.upsert_checkpoint(&cp).unwrap();
        assert!(store.incomplete_checkpoints_for_peer("peer-1").unwrap().is_empty());

        store.remove_checkpoint("big.bin", "peer-1").unwrap();
        assert!(store.get_checkpoint("big.bin", "peer-1").unwrap().is_none());
    }

    #[test]
    fn snapshot_is_detached() {
        let store = StateStore::open_in_memory().unwrap();
        store.add_or_update(&sample("a.txt", "aa")).unwrap();
        let snap = store.snapshot();
        store.add_or_update(&sample("b.txt", "bb")).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(store.count(), 2);
    }
}
