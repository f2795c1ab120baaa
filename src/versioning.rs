/// File Versioning Module
///
/// Before a tracked file is replaced or removed, its current content is
/// copied to `.swarm/versions/<relpath>/<timestamp>`. Retention is bounded
/// by count and age; pruning runs opportunistically after each snapshot.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncResult;
use crate::schedule::{compact_timestamp, now_ms};

pub const DEFAULT_KEEP_COUNT: usize = 10;
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotReason {
    Update,
    Delete,
    Rename,
    ConflictResolution,
}

/// Record of one stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub relative_path: String,
    pub timestamp: String,
    pub size: u64,
    pub reason: SnapshotReason,
}

/// Snapshot store rooted in the sync folder.
pub struct VersionStore {
    sync_root: PathBuf,
    versions_dir: PathBuf,
    keep_count: usize,
    max_age_days: i64,
}

impl VersionStore {
    pub fn new(sync_root: &Path) -> Self {
        Self {
            sync_root: sync_root.to_path_buf(),
            versions_dir: sync_root.join(".swarm").join("versions"),
            keep_count: DEFAULT_KEEP_COUNT,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }

    pub fn with_retention(mut self, keep_count: usize, max_age_days: i64) -> Self {
        self.keep_count = keep_count;
        self.max_age_days = max_age_days;
        self
    }

    /// Copy the current content of `relative_path` into the version store.
    /// Returns None when there is nothing on disk to preserve.
    pub fn snapshot(
        &self,
        relative_path: &str,
        reason: SnapshotReason,
    ) -> SyncResult<Option<VersionRecord>> {
        let source = self.sync_root.join(relative_path);
        let metadata = match std::fs::metadata(&source) {
            Ok(m) if m.is_file() => m,
            _ => return Ok(None),
        };

        let dir = self.versions_dir.join(relative_path);
        std::fs::create_dir_all(&dir)?;
        let timestamp = compact_timestamp(now_ms());
        let mut dest = dir.join(&timestamp);
        // Two snapshots within the same second get distinct names.
        let mut counter = 1;
        while dest.exists() {
            dest = dir.join(format!("{}-{}", timestamp, counter));
            counter += 1;
        }
        std::fs::copy(&source, &dest)?;

        let record = VersionRecord {
            relative_path: relative_path.to_string(),
            timestamp: dest.file_name().unwrap().to_string_lossy().to_string(),
            size: metadata.len(),
            reason,
        };
        self.prune(relative_path)?;
        Ok(Some(record))
    }

    /// Stored versions for one path, oldest first.
    pub fn list_versions(&self, relative_path: &str) -> SyncResult<Vec<(String, u64)>> {
        let dir = self.versions_dir.join(relative_path);
        let mut versions = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(versions),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                versions.push((
                    entry.file_name().to_string_lossy().to_string(),
                    entry.metadata()?.len(),
                ));
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Path of a stored version, for restore flows.
    pub fn version_path(&self, relative_path: &str, timestamp: &str) -> PathBuf {
        self.versions_dir.join(relative_path).join(timestamp)
    }

    /// Drop versions beyond the retention count or older than the age limit.
    pub fn prune(&self, relative_path: &str) -> SyncResult<()> {
        let versions = self.list_versions(relative_path)?;
        let cutoff = compact_timestamp(now_ms() - self.max_age_days * 24 * 3600 * 1000);

        let excess = versions.len().saturating_sub(self.keep_count);
        for (i, (name, _)) in versions.iter().enumerate() {
            // Timestamp names sort chronologically, so a lexicographic
            // compare against the cutoff is an age compare.
            let too_old = name.as_str() < cutoff.as_str();
            if i < excess || too_old {
                let _ = std::fs::remove_file(self.version_path(relative_path, name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_current_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("doc.txt"), b"version one").unwrap();

        let store = VersionStore::new(root);
        let record = store.snapshot("doc.txt", SnapshotReason::Update).unwrap().unwrap();
        assert_eq!(record.size, 11);

        let versions = store.list_versions("doc.txt").unwrap();
        assert_eq!(versions.len(), 1);
        let stored = store.version_path("doc.txt", &versions[0].0);
        assert_eq!(std::fs::read(stored).unwrap(), b"version one");
    }

    #[test]
    fn snapshot_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        assert!(store.snapshot("ghost.txt", SnapshotReason::Delete).unwrap().is_none());
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let store = VersionStore::new(root).with_retention(2, 30);

        for i in 0..4 {
            std::fs::write(root.join("doc.txt"), format!("content {}", i)).unwrap();
            store.snapshot("doc.txt", SnapshotReason::Update).unwrap();
        }

        let versions = store.list_versions("doc.txt").unwrap();
        assert_eq!(versions.len(), 2);
        let newest = store.version_path("doc.txt", &versions[1].0);
        assert_eq!(std::fs::read(newest).unwrap(), b"content 3");
    }

    #[test]
    fn nested_paths_mirror_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/c.txt"), b"deep").unwrap();

        let store = VersionStore::new(root);
        store.snapshot("a/b/c.txt", SnapshotReason::Rename).unwrap().unwrap();
        assert_eq!(store.list_versions("a/b/c.txt").unwrap().len(), 1);
    }
}
