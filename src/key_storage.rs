/// Secure Key Storage Module
///
/// Persistence interface for the device identity private key. Platform
/// credential stores (keychain, DPAPI) plug in behind the same trait; the
/// built-in backend is a restricted-permission file vault under the
/// daemon's data directory.
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};

/// Storage backend for named secret byte blobs.
pub trait KeyStorage: Send + Sync {
    fn store(&self, name: &str, bytes: &[u8]) -> SyncResult<()>;
    fn retrieve(&self, name: &str) -> SyncResult<Option<Vec<u8>>>;
    fn exists(&self, name: &str) -> SyncResult<bool>;
    fn delete(&self, name: &str) -> SyncResult<()>;
}

/// File-vault backend: one file per key under `dir`, owner-read-only on unix.
pub struct FileKeyStorage {
    dir: PathBuf,
}

impl FileKeyStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, name: &str) -> SyncResult<PathBuf> {
        // Key names become file names directly; reject anything that could
        // escape the vault directory.
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(SyncError::Config(format!("illegal key name: {}", name)));
        }
        Ok(self.dir.join(format!("{}.key", name)))
    }
}

impl KeyStorage for FileKeyStorage {
    fn store(&self, name: &str, bytes: &[u8]) -> SyncResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name)?;
        fs::write(&path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn retrieve(&self, name: &str) -> SyncResult<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> SyncResult<bool> {
        Ok(self.path_for(name)?.exists())
    }

    fn delete(&self, name: &str) -> SyncResult<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKeyStorage {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn store(&self, name: &str, bytes: &[u8]) -> SyncResult<()> {
        self.keys.lock().unwrap().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn retrieve(&self, name: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.keys.lock().unwrap().get(name).cloned())
    }

    fn exists(&self, name: &str) -> SyncResult<bool> {
        Ok(self.keys.lock().unwrap().contains_key(name))
    }

    fn delete(&self, name: &str) -> SyncResult<()> {
        self.keys.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Name under which the device identity private key is stored.
pub const IDENTITY_KEY_NAME: &str = "identity";

/// Load the identity keypair from storage, generating and persisting a new
/// one on first run.
pub fn load_or_create_identity(
    storage: &dyn KeyStorage,
) -> SyncResult<crate::crypto::IdentityKeypair> {
    if let Some(bytes) = storage.retrieve(IDENTITY_KEY_NAME)? {
        return crate::crypto::IdentityKeypair::from_bytes(&bytes);
    }
    let keypair = crate::crypto::IdentityKeypair::generate();
    storage.store(IDENTITY_KEY_NAME, &keypair.to_bytes())?;
    tracing::info!(target: "swarm::identity", "generated new identity key, fingerprint {}", keypair.fingerprint());
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path().join("keys"));

        assert!(!storage.exists("identity").unwrap());
        storage.store("identity", b"secret-bytes").unwrap();
        assert!(storage.exists("identity").unwrap());
        assert_eq!(storage.retrieve("identity").unwrap().unwrap(), b"secret-bytes");

        storage.delete("identity").unwrap();
        assert!(!storage.exists("identity").unwrap());
        // Deleting a missing key is idempotent
        storage.delete("identity").unwrap();
    }

    #[test]
    fn rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path().to_path_buf());
        assert!(storage.store("../evil", b"x").is_err());
        assert!(storage.store("a/b", b"x").is_err());
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let storage = MemoryKeyStorage::new();
        let first = load_or_create_identity(&storage).unwrap();
        let second = load_or_create_identity(&storage).unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
    }
}
