/// Activity Log Module
///
/// Append-only history of everything the daemon does: a bounded in-memory
/// ring for UI consumers plus a JSON-lines spill file under `.swarm/`.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::schedule::now_ms;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivitySeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    PeerDiscovered,
    PeerLost,
    FileCreated,
    FileUpdated,
    FileDeleted,
    FileRenamed,
    TransferStarted,
    TransferCompleted,
    TransferFailed,
    ConflictDetected,
    ConflictResolved,
    VaultCreated,
    VaultUnlocked,
    VaultLocked,
    Rescan,
    Fault,
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// UTC milliseconds.
    pub timestamp_ms: i64,
    pub kind: ActivityKind,
    pub severity: ActivitySeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, severity: ActivitySeverity, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: now_ms(),
            kind,
            severity,
            message: message.into(),
            relative_path: None,
            peer_id: None,
            details: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer_id = Some(peer.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

struct Inner {
    ring: VecDeque<ActivityEntry>,
    spill: Option<std::fs::File>,
}

/// Bounded ring of activity entries with disk spill.
pub struct ActivityLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ActivityLog {
    /// Open the log, appending to `spill_path` (created if absent). Pass
    /// None to keep the log memory-only (tests).
    pub fn open(spill_path: Option<PathBuf>, capacity: usize) -> Self {
        let spill = spill_path.and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(target: "swarm::activity", "cannot open spill file {:?}: {}", path, e);
                    None
                }
            }
        });
        Self {
            inner: Mutex::new(Inner { ring: VecDeque::with_capacity(capacity.min(1024)), spill }),
            capacity,
        }
    }

    /// Append an entry, spilling one JSON line to disk. Returns the entry so
    /// the caller can forward it to the event bus.
    pub fn append(&self, entry: ActivityEntry) -> ActivityEntry {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() >= self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(entry.clone());
        if let Some(file) = inner.spill.as_mut() {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{}", line) {
                        tracing::warn!(target: "swarm::activity", "spill write failed: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "swarm::activity", "spill encode failed: {}", e);
                }
            }
        }
        entry
    }

    /// The most recent `n` entries, newest last.
    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        let inner = self.inner.lock().unwrap();
        inner.ring.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let log = ActivityLog::open(None, 3);
        for i in 0..5 {
            log.append(ActivityEntry::new(
                ActivityKind::FileUpdated,
                ActivitySeverity::Info,
                format!("change {}", i),
            ));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent.first().unwrap().message, "change 2");
        assert_eq!(recent.last().unwrap().message, "change 4");
    }

    #[test]
    fn spills_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".swarm").join("activity.log");
        let log = ActivityLog::open(Some(path.clone()), 100);
        log.append(
            ActivityEntry::new(ActivityKind::TransferCompleted, ActivitySeverity::Info, "sent")
                .with_path("a.txt")
                .with_peer("peer-1"),
        );
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        let parsed: ActivityEntry = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.relative_path.as_deref(), Some("a.txt"));
        assert_eq!(parsed.kind, ActivityKind::TransferCompleted);
    }
}
