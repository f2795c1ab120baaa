//! Integration tests over the public library surface: durable state,
//! vault lifecycle, delta exchange, and ignore evaluation working together
//! the way the daemon drives them.

use swarmsync::crypto;
use swarmsync::delta::{self, DeltaInstruction, BLOCK_SIZE};
use swarmsync::ignore::IgnoreMatcher;
use swarmsync::protocol::{encode_payload, DeltaPayload, SignaturesPayload};
use swarmsync::state_store::{FileAction, StateStore, SyncedFile};
use swarmsync::vault::VaultManager;

fn tracked_file(path: &str, contents: &[u8]) -> SyncedFile {
    SyncedFile {
        relative_path: path.to_string(),
        content_hash: crypto::sha256_hex(contents),
        size: contents.len() as u64,
        last_modified_ms: 1_714_564_800_000,
        action: FileAction::Create,
        source_peer_id: String::new(),
        is_directory: false,
        old_relative_path: None,
    }
}

#[test]
fn file_state_survives_reopen_and_upserts_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join(".swarm").join("state.db");

    let state = tracked_file("docs/hello.txt", b"Hi\n");
    {
        let store = StateStore::open(&db).unwrap();
        store.add_or_update(&state).unwrap();
        store.add_or_update(&state).unwrap();
        assert_eq!(store.count(), 1);
        store.save_changes().unwrap();
    }

    let store = StateStore::open(&db).unwrap();
    let loaded = store.get("docs/hello.txt").unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.size, 3);
    assert_eq!(
        loaded.content_hash,
        "c01a4cfa25cb895cdd0bb25181ba9c1622e93895a6de6f533a7299f70d6b0cfb"
    );
}

#[test]
fn vault_lifecycle_with_wrong_and_right_password() {
    let dir = tempfile::tempdir().unwrap();
    let vault = VaultManager::new(dir.path(), 15);
    std::fs::create_dir_all(dir.path().join("secret")).unwrap();
    vault.create("secret", "correct horse").unwrap();

    let plain = dir.path().join("secret").join("a.txt");
    std::fs::write(&plain, b"plain").unwrap();
    vault.encrypt_file("secret", &plain, "a.txt").unwrap();
    assert!(!plain.exists());

    vault.lock("secret");
    assert!(vault.is_locked("secret"));

    // Wrong password leaves the folder locked
    assert!(vault.unlock("secret", "wrong").is_err());
    assert!(vault.is_locked("secret"));

    vault.unlock("secret", "correct horse").unwrap();
    assert_eq!(vault.decrypt_by_real_name("secret", "a.txt").unwrap(), b"plain");
}

#[test]
fn vault_roundtrips_various_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let vault = VaultManager::new(dir.path(), 15);
    std::fs::create_dir_all(dir.path().join("vault")).unwrap();
    vault.create("vault", "pw").unwrap();

    for (i, len) in [0usize, 1, 32 * 1024 - 1, 32 * 1024, 32 * 1024 + 1, 200_000]
        .iter()
        .enumerate()
    {
        let name = format!("blob{}.bin", i);
        let data: Vec<u8> = (0..*len).map(|b| (b % 256) as u8).collect();
        let path = dir.path().join("vault").join(&name);
        std::fs::write(&path, &data).unwrap();
        vault.encrypt_file("vault", &path, &name).unwrap();
        assert_eq!(vault.decrypt_by_real_name("vault", &name).unwrap(), data, "len {}", len);
    }
}

#[test]
fn delta_append_to_megabyte_file_is_small_on_the_wire() {
    // A synced 1 MiB file gets four bytes appended; only the tail should
    // travel.
    let base: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let mut target = base.clone();
    target.extend_from_slice(b"tail");

    let signatures = delta::compute_signatures(&base[..]).unwrap();
    assert_eq!(signatures.len(), 256);
    let signatures_payload = SignaturesPayload {
        relative_path: "log.txt".to_string(),
        block_size: BLOCK_SIZE as u32,
        signatures: signatures.clone(),
    };
    let sig_bytes = encode_payload(&signatures_payload).unwrap();
    assert!(sig_bytes.len() <= 16 * 1024, "signatures were {} bytes", sig_bytes.len());

    let instructions = delta::compute_delta(&target, &signatures);
    let copies = instructions
        .iter()
        .filter(|i| matches!(i, DeltaInstruction::Copy { .. }))
        .count();
    let inserted: Vec<&Vec<u8>> = instructions
        .iter()
        .filter_map(|i| match i {
            DeltaInstruction::Insert { bytes } => Some(bytes),
            _ => None,
        })
        .collect();
    assert_eq!(copies, 256);
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].as_slice(), b"tail");

    let state = tracked_file("log.txt", &target);
    let body = encode_payload(&DeltaPayload { state, instructions: instructions.clone() }).unwrap();
    assert!(body.len() < 2 * 1024 + 4096, "delta body was {} bytes", body.len());

    let rebuilt = delta::apply_delta_to_vec(&base, &instructions).unwrap();
    assert_eq!(crypto::sha256_hex(&rebuilt), crypto::sha256_hex(&target));
    assert_eq!(rebuilt.len() as u64, delta::delta_output_len(&instructions));
}

#[test]
fn delta_survives_unicode_and_gigantic_literals() {
    let base = "héllo wörld ".repeat(1000).into_bytes();
    let target = "HÉLLO WÖRLD ".repeat(1100).into_bytes();
    let signatures = delta::compute_signatures(&base[..]).unwrap();
    let instructions = delta::compute_delta(&target, &signatures);
    assert_eq!(delta::apply_delta_to_vec(&base, &instructions).unwrap(), target);
}

#[test]
fn swarmignore_keeps_negated_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".swarmignore"), "*.tmp\n!keep.tmp\n").unwrap();
    let matcher = IgnoreMatcher::new(dir.path(), Vec::new());

    assert!(matcher.is_ignored("scratch.tmp", false));
    assert!(!matcher.is_ignored("keep.tmp", false));
    assert!(!matcher.is_ignored("notes.md", false));
    // Internals never sync regardless of patterns
    assert!(matcher.is_ignored(".swarm/state.db", false));
    assert!(matcher.is_ignored("secret/.swarm-vault/config.json", false));
}

#[test]
fn unicode_and_spaced_paths_are_tracked_verbatim() {
    let store = StateStore::open_in_memory().unwrap();
    for path in ["Ünïcode/fïle.txt", "with spaces/a b.txt", "emoji/📄.md"] {
        store.add_or_update(&tracked_file(path, b"x")).unwrap();
        assert!(store.exists(path), "{} missing", path);
        assert_eq!(store.get(path).unwrap().relative_path, path);
    }
    assert_eq!(store.count(), 3);
}
