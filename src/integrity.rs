/// Integrity Check Module
///
/// Walks every tracked file, recomputes its hash, and classifies it as
/// healthy, corrupted, or missing. Non-destructive: the repository is never
/// mutated here; drift repair is the rescan's job.
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::crypto;
use crate::error::SyncResult;
use crate::state_store::{FileAction, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileHealth {
    Healthy,
    Corrupted,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub relative_path: String,
    pub health: FileHealth,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
}

/// Outcome of one integrity walk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityResult {
    pub files_checked: usize,
    pub healthy: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityResult {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Recompute hashes for all tracked, non-deleted files under `sync_root`.
pub fn check(store: &StateStore, sync_root: &Path) -> SyncResult<IntegrityResult> {
    let mut result = IntegrityResult::default();
    for state in store.snapshot() {
        if state.is_directory || state.action == FileAction::Delete {
            continue;
        }
        result.files_checked += 1;
        let path = sync_root.join(&state.relative_path);
        if !path.is_file() {
            result.issues.push(IntegrityIssue {
                relative_path: state.relative_path,
                health: FileHealth::Missing,
                expected_hash: state.content_hash,
                actual_hash: None,
            });
            continue;
        }
        let actual = crypto::sha256_file(&path)?;
        if actual == state.content_hash {
            result.healthy += 1;
        } else {
            result.issues.push(IntegrityIssue {
                relative_path: state.relative_path,
                health: FileHealth::Corrupted,
                expected_hash: state.content_hash,
                actual_hash: Some(actual),
            });
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::SyncedFile;

    fn track(store: &StateStore, root: &Path, rel: &str, contents: &[u8]) {
        std::fs::write(root.join(rel), contents).unwrap();
        store
            .add_or_update(&SyncedFile {
                relative_path: rel.to_string(),
                content_hash: crypto::sha256_hex(contents),
                size: contents.len() as u64,
                last_modified_ms: 0,
                action: FileAction::Create,
                source_peer_id: String::new(),
                is_directory: false,
                old_relative_path: None,
            })
            .unwrap();
    }

    #[test]
    fn classifies_all_three_states() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let store = StateStore::open_in_memory().unwrap();

        track(&store, root, "good.txt", b"fine");
        track(&store, root, "bad.txt", b"original");
        track(&store, root, "gone.txt", b"soon gone");

        std::fs::write(root.join("bad.txt"), b"tampered").unwrap();
        std::fs::remove_file(root.join("gone.txt")).unwrap();

        let result = check(&store, root).unwrap();
        assert_eq!(result.files_checked, 3);
        assert_eq!(result.healthy, 1);
        assert_eq!(result.issues.len(), 2);
        assert!(!result.is_clean());

        let bad = result.issues.iter().find(|i| i.relative_path == "bad.txt").unwrap();
        assert_eq!(bad.health, FileHealth::Corrupted);
        assert!(bad.actual_hash.is_some());

        let gone = result.issues.iter().find(|i| i.relative_path == "gone.txt").unwrap();
        assert_eq!(gone.health, FileHealth::Missing);
    }

    #[test]
    fn store_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        track(&store, dir.path(), "a.txt", b"data");
        std::fs::write(dir.path().join("a.txt"), b"drifted").unwrap();

        let before = store.get("a.txt").unwrap();
        check(&store, dir.path()).unwrap();
        assert_eq!(store.get("a.txt").unwrap(), before);
    }
}
