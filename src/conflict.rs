/// Conflict Detection & Resolution Module
///
/// A conflict exists when a file diverged locally while a different remote
/// version arrived: disk hash ≠ repository hash AND incoming hash ≠
/// repository hash. The core only detects; resolution comes either from a
/// per-peer automatic policy or from the resolver collaborator.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::schedule::now_ms;

/// The four ways out of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Drop the incoming version and push our state back as an update.
    KeepLocal,
    /// Apply the incoming version over ours.
    KeepRemote,
    /// Apply the incoming version under a conflict-suffixed name.
    KeepBoth,
    /// Leave both sides untouched; record only.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    Auto,
    User,
}

/// Automatic policy a trusted peer may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoResolvePolicy {
    /// Strictly greater mtime wins; exact ties break on the
    /// lexicographically greater hash.
    LastWriterWins,
    KeepBoth,
}

/// One detected conflict and, once decided, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub relative_path: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub local_modified_ms: i64,
    pub remote_modified_ms: i64,
    pub source_peer_id: String,
    pub resolution: Option<ConflictResolution>,
    pub method: Option<ResolutionMethod>,
    pub resolved_at_ms: Option<i64>,
}

impl ConflictRecord {
    pub fn resolve(&mut self, resolution: ConflictResolution, method: ResolutionMethod) {
        self.resolution = Some(resolution);
        self.method = Some(method);
        self.resolved_at_ms = Some(now_ms());
    }
}

/// Apply an automatic policy to a conflict. Returns None when the policy
/// cannot decide (equal mtimes never auto-resolve under anything but an
/// explicit LastWriterWins).
pub fn decide_auto(policy: AutoResolvePolicy, record: &ConflictRecord) -> Option<ConflictResolution> {
    match policy {
        AutoResolvePolicy::KeepBoth => Some(ConflictResolution::KeepBoth),
        AutoResolvePolicy::LastWriterWins => {
            if record.remote_modified_ms > record.local_modified_ms {
                Some(ConflictResolution::KeepRemote)
            } else if record.local_modified_ms > record.remote_modified_ms {
                Some(ConflictResolution::KeepLocal)
            } else if record.remote_hash > record.local_hash {
                Some(ConflictResolution::KeepRemote)
            } else if record.local_hash > record.remote_hash {
                Some(ConflictResolution::KeepLocal)
            } else {
                // Same mtime and same hash is not a conflict at all.
                None
            }
        }
    }
}

/// Collaborator that decides conflicts the automatic policies cannot.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, record: &ConflictRecord) -> ConflictResolution;
}

/// Default resolver for headless runs: never touches either side.
pub struct SkipResolver;

#[async_trait]
impl ConflictResolver for SkipResolver {
    async fn resolve(&self, _record: &ConflictRecord) -> ConflictResolution {
        ConflictResolution::Skip
    }
}

/// Name used for the remote copy under KeepBoth, e.g.
/// `notes (conflict from builder 2024-05-01T12-00-00Z).md`.
pub fn keep_both_name(relative_path: &str, peer_name: &str, timestamp_ms: i64) -> String {
    let ts = chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).unwrap())
        .format("%Y-%m-%dT%H-%M-%SZ");
    let path = Path::new(relative_path);
    let parent = path.parent().map(|p| p.to_string_lossy().replace('\\', "/"));
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let suffixed = match path.extension() {
        Some(ext) => format!("{} (conflict from {} {}).{}", stem, peer_name, ts, ext.to_string_lossy()),
        None => format!("{} (conflict from {} {})", stem, peer_name, ts),
    };
    match parent.as_deref() {
        Some("") | None => suffixed,
        Some(parent) => format!("{}/{}", parent, suffixed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(local_ms: i64, remote_ms: i64, local_hash: &str, remote_hash: &str) -> ConflictRecord {
        ConflictRecord {
            relative_path: "notes.md".to_string(),
            local_hash: local_hash.to_string(),
            remote_hash: remote_hash.to_string(),
            local_modified_ms: local_ms,
            remote_modified_ms: remote_ms,
            source_peer_id: "peer".to_string(),
            resolution: None,
            method: None,
            resolved_at_ms: None,
        }
    }

    #[test]
    fn last_writer_wins_on_mtime() {
        let newer_remote = record(100, 200, "aa", "bb");
        assert_eq!(
            decide_auto(AutoResolvePolicy::LastWriterWins, &newer_remote),
            Some(ConflictResolution::KeepRemote)
        );
        let newer_local = record(300, 200, "aa", "bb");
        assert_eq!(
            decide_auto(AutoResolvePolicy::LastWriterWins, &newer_local),
            Some(ConflictResolution::KeepLocal)
        );
    }

    #[test]
    fn equal_mtime_breaks_on_hash() {
        let tie = record(200, 200, "aa", "bb");
        assert_eq!(
            decide_auto(AutoResolvePolicy::LastWriterWins, &tie),
            Some(ConflictResolution::KeepRemote)
        );
        let tie_local = record(200, 200, "ff", "bb");
        assert_eq!(
            decide_auto(AutoResolvePolicy::LastWriterWins, &tie_local),
            Some(ConflictResolution::KeepLocal)
        );
    }

    #[test]
    fn keep_both_policy_always_decides() {
        let r = record(1, 2, "aa", "bb");
        assert_eq!(
            decide_auto(AutoResolvePolicy::KeepBoth, &r),
            Some(ConflictResolution::KeepBoth)
        );
    }

    #[test]
    fn keep_both_name_matches_layout() {
        // 2024-05-01T12:00:00Z
        let name = keep_both_name("notes.md", "B", 1_714_564_800_000);
        assert_eq!(name, "notes (conflict from B 2024-05-01T12-00-00Z).md");

        let nested = keep_both_name("dir/report", "builder", 1_714_564_800_000);
        assert_eq!(nested, "dir/report (conflict from builder 2024-05-01T12-00-00Z)");
    }
}
