/// File Transfer Module
///
/// Chunked file body exchange over an established session. Outgoing files
/// stream in 256 KiB wire chunks behind a FileHeader/FileChunk/FileEnd
/// subprotocol keyed by a transfer ID, so transfers may interleave on one
/// connection. Incoming bodies assemble into a temp file next to the target
/// with a streamed hash, then atomically rename over it once the hash
/// matches. Both directions persist checkpoints so a crash or disconnect
/// resumes instead of restarting.
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::StreamingHasher;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::protocol::{
    encode_payload, FileChunkPayload, FileEndPayload, FileHeaderPayload, FrameKind,
};
use crate::schedule::now_ms;
use crate::state_store::{StateStore, SyncedFile, TransferCheckpoint, TransferDirection};
use crate::transport::SessionHandle;

/// Wire chunk size for file bodies.
pub const WIRE_CHUNK: usize = 256 * 1024;

/// Incoming checkpoints below this size are discarded on interruption.
pub const CHECKPOINT_MIN_BYTES: u64 = 64 * 1024;

/// Checkpoint (and progress event) cadence, in chunks.
const CHECKPOINT_EVERY_CHUNKS: u64 = 8;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry transient file operations (rename/open) that fail with
/// sharing-violation-style errors.
pub async fn retry_io<T, F>(mut op: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS && is_sharing_violation(&e) => {
                attempt += 1;
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_sharing_violation(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::WouldBlock
    )
}

/// Temp file path for an incoming body, alongside the target.
pub fn temp_path_for(sync_root: &Path, relative_path: &str, transfer_id: &Uuid) -> PathBuf {
    let target = sync_root.join(relative_path);
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "incoming".to_string());
    let id = transfer_id.simple().to_string();
    target.with_file_name(format!(".{}.{}.swarmpart", file_name, &id[..8]))
}

/// Stream one file to a peer, resuming from `start_offset` when nonzero.
pub async fn send_file(
    session: &SessionHandle,
    store: &StateStore,
    events: &EventBus,
    sync_root: &Path,
    state: &SyncedFile,
    start_offset: u64,
) -> SyncResult<()> {
    let path = sync_root.join(&state.relative_path);
    let transfer_id = Uuid::new_v4();
    let peer = session.peer_id.to_string();

    let header = FileHeaderPayload {
        transfer_id,
        relative_path: state.relative_path.clone(),
        size: state.size,
        content_hash: state.content_hash.clone(),
        last_modified_ms: state.last_modified_ms,
        start_offset,
    };
    session.send(FrameKind::FileHeader, encode_payload(&header)?).await?;
    events.emit(SyncEvent::TransferStarted {
        relative_path: state.relative_path.clone(),
        peer_id: session.peer_id,
        direction: TransferDirection::Outgoing,
        total_bytes: state.size,
    });

    let started = now_ms();
    let mut file = std::fs::File::open(&path)?;
    file.seek(SeekFrom::Start(start_offset))?;
    let mut offset = start_offset;
    let mut chunk_count = 0u64;
    let mut buf = vec![0u8; WIRE_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = FileChunkPayload { transfer_id, offset, bytes: buf[..n].to_vec() };
        if let Err(e) = session.send(FrameKind::FileChunk, encode_payload(&chunk)?).await {
            // The session died mid-stream; leave a checkpoint for resume.
            store.upsert_checkpoint(&TransferCheckpoint {
                relative_path: state.relative_path.clone(),
                peer_id: peer.clone(),
                direction: TransferDirection::Outgoing,
                total_bytes: state.size,
                bytes_transferred: offset,
                content_hash: state.content_hash.clone(),
                temp_file_path: String::new(),
                started_at_ms: started,
                updated_at_ms: now_ms(),
                completed: false,
            })?;
            return Err(e);
        }
        offset += n as u64;
        chunk_count += 1;
        if chunk_count % CHECKPOINT_EVERY_CHUNKS == 0 {
            store.upsert_checkpoint(&TransferCheckpoint {
                relative_path: state.relative_path.clone(),
                peer_id: peer.clone(),
                direction: TransferDirection::Outgoing,
                total_bytes: state.size,
                bytes_transferred: offset,
                content_hash: state.content_hash.clone(),
                temp_file_path: String::new(),
                started_at_ms: started,
                updated_at_ms: now_ms(),
                completed: false,
            })?;
            events.emit(SyncEvent::TransferProgress {
                relative_path: state.relative_path.clone(),
                peer_id: session.peer_id,
                bytes_transferred: offset,
                total_bytes: state.size,
            });
        }
    }

    let end = FileEndPayload {
        transfer_id,
        relative_path: state.relative_path.clone(),
        content_hash: state.content_hash.clone(),
    };
    session.send(FrameKind::FileEnd, encode_payload(&end)?).await?;
    store.remove_checkpoint(&state.relative_path, &peer)?;
    events.emit(SyncEvent::TransferCompleted {
        relative_path: state.relative_path.clone(),
        peer_id: session.peer_id,
    });
    tracing::info!(
        target: "swarm::transfer",
        "sent {} ({} bytes) to {}", state.relative_path, offset, session.peer_name
    );
    Ok(())
}

/// Assembly state of one incoming file body.
pub struct IncomingTransfer {
    pub transfer_id: Uuid,
    pub relative_path: String,
    pub peer_id: Uuid,
    pub expected_hash: String,
    pub total_bytes: u64,
    pub last_modified_ms: i64,
    pub source_peer_id: String,
    pub bytes_received: u64,
    temp_path: PathBuf,
    /// Checkpoints stay keyed by the original path even if the output is
    /// retargeted to a conflict copy.
    checkpoint_path: String,
    file: std::fs::File,
    hasher: StreamingHasher,
    started_at_ms: i64,
    chunks_since_checkpoint: u64,
}

impl IncomingTransfer {
    /// Open the temp file for a transfer announced by `header`. When the
    /// header resumes (`start_offset > 0`) the existing partial is reopened
    /// and its prefix re-hashed so the streamed hash still covers every
    /// byte.
    pub fn begin(
        sync_root: &Path,
        header: &FileHeaderPayload,
        peer_id: Uuid,
        temp_override: Option<PathBuf>,
    ) -> SyncResult<Self> {
        let temp_path =
            temp_override.unwrap_or_else(|| temp_path_for(sync_root, &header.relative_path, &header.transfer_id));
        if let Some(parent) = temp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut hasher = StreamingHasher::new();
        let file = if header.start_offset > 0 {
            if !temp_path.exists() {
                return Err(SyncError::TransferInterrupted {
                    path: header.relative_path.clone(),
                    resumable: false,
                });
            }
            let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&temp_path)?;
            let existing = file.metadata()?.len();
            if existing < header.start_offset {
                return Err(SyncError::TransferInterrupted {
                    path: header.relative_path.clone(),
                    resumable: false,
                });
            }
            file.seek(SeekFrom::Start(0))?;
            let mut remaining = header.start_offset;
            let mut buf = vec![0u8; WIRE_CHUNK];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                file.read_exact(&mut buf[..want])?;
                hasher.update(&buf[..want]);
                remaining -= want as u64;
            }
            file.set_len(header.start_offset)?;
            file.seek(SeekFrom::Start(header.start_offset))?;
            file
        } else {
            std::fs::File::create(&temp_path)?
        };

        Ok(Self {
            transfer_id: header.transfer_id,
            relative_path: header.relative_path.clone(),
            peer_id,
            expected_hash: header.content_hash.clone(),
            total_bytes: header.size,
            last_modified_ms: header.last_modified_ms,
            source_peer_id: peer_id.to_string(),
            bytes_received: header.start_offset,
            temp_path,
            checkpoint_path: header.relative_path.clone(),
            file,
            hasher,
            started_at_ms: now_ms(),
            chunks_since_checkpoint: 0,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Redirect the finished file to a different relative path (conflict
    /// copies under KeepBoth).
    pub fn retarget(&mut self, new_relative_path: String) {
        self.relative_path = new_relative_path;
    }

    /// Append one chunk. Chunks of a single transfer arrive in order on the
    /// connection, so any offset gap is a protocol violation.
    pub fn write_chunk(&mut self, store: &StateStore, chunk: &FileChunkPayload) -> SyncResult<bool> {
        if chunk.offset != self.bytes_received {
            return Err(SyncError::Protocol(format!(
                "chunk for {} arrived at offset {} but {} bytes are assembled",
                self.relative_path, chunk.offset, self.bytes_received
            )));
        }
        self.file.write_all(&chunk.bytes)?;
        self.hasher.update(&chunk.bytes);
        self.bytes_received += chunk.bytes.len() as u64;
        self.chunks_since_checkpoint += 1;

        if self.chunks_since_checkpoint >= CHECKPOINT_EVERY_CHUNKS {
            self.chunks_since_checkpoint = 0;
            self.write_checkpoint(store)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn write_checkpoint(&self, store: &StateStore) -> SyncResult<()> {
        store.upsert_checkpoint(&TransferCheckpoint {
            relative_path: self.checkpoint_path.clone(),
            peer_id: self.peer_id.to_string(),
            direction: TransferDirection::Incoming,
            total_bytes: self.total_bytes,
            bytes_transferred: self.bytes_received,
            content_hash: self.expected_hash.clone(),
            temp_file_path: self.temp_path.to_string_lossy().to_string(),
            started_at_ms: self.started_at_ms,
            updated_at_ms: now_ms(),
            completed: false,
        })
    }

    /// Verify the streamed hash and atomically move the temp file over the
    /// target. On mismatch the temp file is deleted and the transfer fails.
    pub async fn finish(
        self,
        store: &StateStore,
        sync_root: &Path,
        end: &FileEndPayload,
    ) -> SyncResult<SyncedFile> {
        let (temp, state) = self.finish_detached(store, end)?;
        let target = sync_root.join(&state.relative_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest = target.clone();
        retry_io(move || std::fs::rename(&temp, &dest)).await?;
        Ok(state)
    }

    /// Like `finish`, but leaves the verified bytes in the temp file and
    /// returns its path; used when a conflict decision is still pending and
    /// the target must not change yet.
    pub fn finish_detached(
        mut self,
        store: &StateStore,
        end: &FileEndPayload,
    ) -> SyncResult<(PathBuf, SyncedFile)> {
        self.file.flush()?;
        self.file.sync_all()?;
        drop(self.file);

        let actual = self.hasher.finalize_hex();
        let expected = if end.content_hash.is_empty() { &self.expected_hash } else { &end.content_hash };
        if &actual != expected {
            let _ = std::fs::remove_file(&self.temp_path);
            let _ = store.remove_checkpoint(&self.checkpoint_path, &self.peer_id.to_string());
            return Err(SyncError::HashMismatch {
                path: self.relative_path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        store.remove_checkpoint(&self.checkpoint_path, &self.peer_id.to_string())?;

        let state = SyncedFile {
            relative_path: self.relative_path,
            content_hash: actual,
            size: self.bytes_received,
            last_modified_ms: self.last_modified_ms,
            action: crate::state_store::FileAction::Update,
            source_peer_id: self.source_peer_id,
            is_directory: false,
            old_relative_path: None,
        };
        Ok((self.temp_path, state))
    }

    /// Tear down after a disconnect. Partial data at or above 64 KiB keeps
    /// its temp file and checkpoint for resume; smaller remnants are
    /// deleted.
    pub fn abort(mut self, store: &StateStore) -> SyncResult<bool> {
        let peer = self.peer_id.to_string();
        if self.bytes_received >= CHECKPOINT_MIN_BYTES {
            self.file.flush()?;
            let _ = self.file.sync_all();
            self.write_checkpoint(store)?;
            Ok(true)
        } else {
            drop(self.file);
            let _ = std::fs::remove_file(&self.temp_path);
            let _ = store.remove_checkpoint(&self.checkpoint_path, &peer);
            Ok(false)
        }
    }
}

/// Emit a progress event; shared by file and delta receive paths.
pub fn emit_progress(
    events: &EventBus,
    relative_path: &str,
    peer_id: Uuid,
    bytes_transferred: u64,
    total_bytes: u64,
) {
    events.emit(SyncEvent::TransferProgress {
        relative_path: relative_path.to_string(),
        peer_id,
        bytes_transferred,
        total_bytes,
    });
}

/// On session establishment, checkpoints describing partially-received
/// files tell us what to re-request from the peer.
pub fn resumable_incoming(store: &StateStore, peer_id: &Uuid) -> Vec<TransferCheckpoint> {
    store
        .incomplete_checkpoints_for_peer(&peer_id.to_string())
        .unwrap_or_default()
        .into_iter()
        .filter(|cp| {
            cp.direction == TransferDirection::Incoming
                && cp.bytes_transferred >= CHECKPOINT_MIN_BYTES
                && Path::new(&cp.temp_file_path).exists()
        })
        .collect()
}

/// Drop checkpoints whose temp files have vanished.
pub fn prune_stale_checkpoints(store: &Arc<StateStore>, peer_id: &Uuid) {
    if let Ok(checkpoints) = store.incomplete_checkpoints_for_peer(&peer_id.to_string()) {
        for cp in checkpoints {
            if cp.direction == TransferDirection::Incoming
                && !cp.temp_file_path.is_empty()
                && !Path::new(&cp.temp_file_path).exists()
            {
                let _ = store.remove_checkpoint(&cp.relative_path, &cp.peer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn header(path: &str, data: &[u8], start: u64) -> FileHeaderPayload {
        FileHeaderPayload {
            transfer_id: Uuid::new_v4(),
            relative_path: path.to_string(),
            size: data.len() as u64,
            content_hash: crypto::sha256_hex(data),
            last_modified_ms: 1_700_000_000_000,
            start_offset: start,
        }
    }

    #[tokio::test]
    async fn incoming_assembles_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let data = vec![7u8; WIRE_CHUNK + 500];
        let h = header("docs/file.bin", &data, 0);
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();

        let peer = Uuid::new_v4();
        let mut incoming = IncomingTransfer::begin(dir.path(), &h, peer, None).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload {
                    transfer_id: h.transfer_id,
                    offset: 0,
                    bytes: data[..WIRE_CHUNK].to_vec(),
                },
            )
            .unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload {
                    transfer_id: h.transfer_id,
                    offset: WIRE_CHUNK as u64,
                    bytes: data[WIRE_CHUNK..].to_vec(),
                },
            )
            .unwrap();

        let end = FileEndPayload {
            transfer_id: h.transfer_id,
            relative_path: h.relative_path.clone(),
            content_hash: h.content_hash.clone(),
        };
        let state = incoming.finish(&store, dir.path(), &end).await.unwrap();
        assert_eq!(state.size, data.len() as u64);
        assert_eq!(std::fs::read(dir.path().join("docs/file.bin")).unwrap(), data);
        assert!(store.get_checkpoint("docs/file.bin", &peer.to_string()).unwrap().is_none());
    }

    #[tokio::test]
    async fn hash_mismatch_discards_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let data = b"expected data".to_vec();
        let h = header("f.txt", &data, 0);

        let mut incoming = IncomingTransfer::begin(dir.path(), &h, Uuid::new_v4(), None).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload {
                    transfer_id: h.transfer_id,
                    offset: 0,
                    bytes: b"tampered bytes".to_vec(),
                },
            )
            .unwrap();
        let temp = incoming.temp_path().to_path_buf();

        let end = FileEndPayload {
            transfer_id: h.transfer_id,
            relative_path: "f.txt".to_string(),
            content_hash: h.content_hash.clone(),
        };
        let err = incoming.finish(&store, dir.path(), &end).await.unwrap_err();
        assert!(matches!(err, SyncError::HashMismatch { .. }));
        assert!(!temp.exists());
        assert!(!dir.path().join("f.txt").exists());
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let data = vec![1u8; 1000];
        let h = header("f.bin", &data, 0);

        let mut incoming = IncomingTransfer::begin(dir.path(), &h, Uuid::new_v4(), None).unwrap();
        let err = incoming
            .write_chunk(
                &store,
                &FileChunkPayload { transfer_id: h.transfer_id, offset: 500, bytes: vec![1u8; 500] },
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn abort_keeps_large_partials_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let peer = Uuid::new_v4();

        // Small partial: discarded
        let small_data = vec![2u8; 1000];
        let h = header("small.bin", &small_data, 0);
        let mut incoming = IncomingTransfer::begin(dir.path(), &h, peer, None).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload { transfer_id: h.transfer_id, offset: 0, bytes: small_data },
            )
            .unwrap();
        let temp = incoming.temp_path().to_path_buf();
        assert!(!incoming.abort(&store).unwrap());
        assert!(!temp.exists());

        // Large partial: kept with checkpoint
        let big = vec![3u8; CHECKPOINT_MIN_BYTES as usize];
        let h = header("big.bin", &[big.clone(), vec![0u8; 5000]].concat(), 0);
        let mut incoming = IncomingTransfer::begin(dir.path(), &h, peer, None).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload { transfer_id: h.transfer_id, offset: 0, bytes: big },
            )
            .unwrap();
        let temp = incoming.temp_path().to_path_buf();
        assert!(incoming.abort(&store).unwrap());
        assert!(temp.exists());

        let cp = store.get_checkpoint("big.bin", &peer.to_string()).unwrap().unwrap();
        assert_eq!(cp.bytes_transferred, CHECKPOINT_MIN_BYTES);
        assert!(!cp.completed);

        let resumable = resumable_incoming(&store, &peer);
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].relative_path, "big.bin");
    }

    #[tokio::test]
    async fn resume_rehashes_existing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 249) as u8).collect();
        let split = 100_000usize;
        let peer = Uuid::new_v4();

        // First half arrives, then the session dies.
        let h1 = header("big.dat", &data, 0);
        let mut incoming = IncomingTransfer::begin(dir.path(), &h1, peer, None).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload {
                    transfer_id: h1.transfer_id,
                    offset: 0,
                    bytes: data[..split].to_vec(),
                },
            )
            .unwrap();
        let temp = incoming.temp_path().to_path_buf();
        assert!(incoming.abort(&store).unwrap());

        // Resume from the checkpointed offset with a fresh header.
        let mut h2 = header("big.dat", &data, split as u64);
        h2.transfer_id = Uuid::new_v4();
        let mut incoming =
            IncomingTransfer::begin(dir.path(), &h2, peer, Some(temp)).unwrap();
        incoming
            .write_chunk(
                &store,
                &FileChunkPayload {
                    transfer_id: h2.transfer_id,
                    offset: split as u64,
                    bytes: data[split..].to_vec(),
                },
            )
            .unwrap();
        let end = FileEndPayload {
            transfer_id: h2.transfer_id,
            relative_path: "big.dat".to_string(),
            content_hash: h2.content_hash.clone(),
        };
        let state = incoming.finish(&store, dir.path(), &end).await.unwrap();
        assert_eq!(state.content_hash, crypto::sha256_hex(&data));
        assert_eq!(std::fs::read(dir.path().join("big.dat")).unwrap(), data);
    }
}
