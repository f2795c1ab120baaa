/// Encrypted Folder (Vault) Module
///
/// A vault folder stores file bodies as authenticated ciphertext under a
/// password-derived key and hides real names behind obfuscated ones. Layout
/// inside the folder:
///
/// - `.swarm-vault/config.json`: salt plus encrypted verifier token
/// - `.swarm-vault/manifest.senc`: encrypted map of obfuscated to real names
/// - `<12 hex chars>.senc`: encrypted file bodies
///
/// Bodies use the SENC container: magic `SENC`, u16 version, u16 chunk size
/// in KiB, then repeated `u32 length ‖ nonce ‖ ciphertext ‖ tag` records of
/// 32 KiB plaintext each. The fixed chunk size keeps single-byte edits local
/// to at most two ciphertext chunks, so delta sync stays effective over the
/// ciphertext.
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroize;

use crate::crypto;
use crate::error::{SyncError, SyncResult};
use crate::schedule::now_ms;

pub const VAULT_DIR: &str = ".swarm-vault";
pub const CONFIG_FILE: &str = "config.json";
pub const MANIFEST_FILE: &str = "manifest.senc";
pub const ENCRYPTED_EXTENSION: &str = "senc";

const SENC_MAGIC: &[u8; 4] = b"SENC";
const SENC_VERSION: u16 = 1;
const CHUNK_SIZE_KB: u16 = 32;
const CHUNK_SIZE: usize = CHUNK_SIZE_KB as usize * 1024;

/// Constant decrypted to prove a password correct.
const VERIFIER: &[u8] = b"SWARM-VAULT-VERIFY-2024";

/// Persisted per-folder vault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub version: u32,
    /// 16-byte salt, hex.
    pub salt: String,
    /// Sealed verifier token, hex.
    pub verifier: String,
}

/// Runtime state of one encrypted folder. The cached key exists only while
/// unlocked and is zeroed on lock.
struct FolderState {
    salt: [u8; 16],
    verifier: Vec<u8>,
    key: Option<[u8; 32]>,
    last_accessed_ms: i64,
}

impl FolderState {
    fn locked(&self) -> bool {
        self.key.is_none()
    }

    fn lock(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
        }
    }
}

/// Manages every encrypted folder under one sync root.
pub struct VaultManager {
    sync_root: PathBuf,
    folders: Mutex<HashMap<String, FolderState>>,
    auto_lock_minutes: u64,
}

impl VaultManager {
    pub fn new(sync_root: &Path, auto_lock_minutes: u64) -> Self {
        Self {
            sync_root: sync_root.to_path_buf(),
            folders: Mutex::new(HashMap::new()),
            auto_lock_minutes,
        }
    }

    fn folder_abs(&self, relative_folder: &str) -> PathBuf {
        self.sync_root.join(relative_folder)
    }

    fn config_path(&self, relative_folder: &str) -> PathBuf {
        self.folder_abs(relative_folder).join(VAULT_DIR).join(CONFIG_FILE)
    }

    fn manifest_path(&self, relative_folder: &str) -> PathBuf {
        self.folder_abs(relative_folder).join(VAULT_DIR).join(MANIFEST_FILE)
    }

    /// Create a new vault folder with the given password. Fails if a vault
    /// already exists there.
    pub fn create(&self, relative_folder: &str, password: &str) -> SyncResult<()> {
        let config_path = self.config_path(relative_folder);
        if config_path.exists() {
            return Err(SyncError::Encryption(format!(
                "vault already exists in {}",
                relative_folder
            )));
        }
        std::fs::create_dir_all(config_path.parent().unwrap())?;

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let key = crypto::derive_password_key(password, &salt);
        let verifier = crypto::seal_chunk(&key, VERIFIER, &[])?;

        let config = VaultConfig {
            version: 1,
            salt: hex::encode(salt),
            verifier: hex::encode(&verifier),
        };
        std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

        // Fresh vaults start with an empty manifest.
        write_manifest(&self.manifest_path(relative_folder), &key, &BTreeMap::new())?;

        self.folders.lock().unwrap().insert(
            relative_folder.to_string(),
            FolderState { salt, verifier, key: Some(key), last_accessed_ms: now_ms() },
        );
        tracing::info!(target: "swarm::vault", "created vault folder {}", relative_folder);
        Ok(())
    }

    /// Load an existing vault's configuration and register it locked.
    pub fn register(&self, relative_folder: &str) -> SyncResult<()> {
        let config_path = self.config_path(relative_folder);
        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| SyncError::Encryption(format!("cannot read vault config: {}", e)))?;
        let config: VaultConfig = serde_json::from_str(&text)?;
        if config.version != 1 {
            return Err(SyncError::Encryption(format!(
                "unsupported vault version {}",
                config.version
            )));
        }
        let salt_vec = hex::decode(&config.salt)?;
        let salt: [u8; 16] = salt_vec
            .try_into()
            .map_err(|_| SyncError::Encryption("vault salt must be 16 bytes".to_string()))?;
        let verifier = hex::decode(&config.verifier)?;

        self.folders.lock().unwrap().insert(
            relative_folder.to_string(),
            FolderState { salt, verifier, key: None, last_accessed_ms: 0 },
        );
        Ok(())
    }

    /// Unlock with a password; wrong passwords fail the verifier decrypt and
    /// leave the folder locked.
    pub fn unlock(&self, relative_folder: &str, password: &str) -> SyncResult<()> {
        let mut folders = self.folders.lock().unwrap();
        let folder = folders
            .get_mut(relative_folder)
            .ok_or_else(|| SyncError::Encryption(format!("unknown vault {}", relative_folder)))?;

        let key = crypto::derive_password_key(password, &folder.salt);
        let decrypted = crypto::open_chunk(&key, &folder.verifier, &[])
            .map_err(|_| SyncError::Encryption("wrong vault password".to_string()))?;
        if decrypted != VERIFIER {
            return Err(SyncError::Encryption("wrong vault password".to_string()));
        }
        folder.key = Some(key);
        folder.last_accessed_ms = now_ms();
        tracing::info!(target: "swarm::vault", "unlocked {}", relative_folder);
        Ok(())
    }

    /// Lock a folder, zeroing the cached key. Idempotent.
    pub fn lock(&self, relative_folder: &str) {
        if let Some(folder) = self.folders.lock().unwrap().get_mut(relative_folder) {
            folder.lock();
            tracing::info!(target: "swarm::vault", "locked {}", relative_folder);
        }
    }

    pub fn is_locked(&self, relative_folder: &str) -> bool {
        self.folders
            .lock()
            .unwrap()
            .get(relative_folder)
            .map(|f| f.locked())
            .unwrap_or(true)
    }

    pub fn known_folders(&self) -> Vec<String> {
        self.folders.lock().unwrap().keys().cloned().collect()
    }

    fn key_for(&self, relative_folder: &str) -> SyncResult<[u8; 32]> {
        let mut folders = self.folders.lock().unwrap();
        let folder = folders
            .get_mut(relative_folder)
            .ok_or_else(|| SyncError::Encryption(format!("unknown vault {}", relative_folder)))?;
        let key = folder
            .key
            .ok_or_else(|| SyncError::Encryption(format!("vault {} is locked", relative_folder)))?;
        folder.last_accessed_ms = now_ms();
        Ok(key)
    }

    /// Encrypt a plaintext file into the vault under a fresh obfuscated
    /// name, record it in the manifest, and remove the plaintext. Returns
    /// the obfuscated file name.
    pub fn encrypt_file(
        &self,
        relative_folder: &str,
        plaintext_path: &Path,
        original_name: &str,
    ) -> SyncResult<String> {
        let key = self.key_for(relative_folder)?;

        let mut name_bytes = [0u8; 6];
        OsRng.fill_bytes(&mut name_bytes);
        let obfuscated = format!("{}.{}", hex::encode(name_bytes), ENCRYPTED_EXTENSION);
        let dest = self.folder_abs(relative_folder).join(&obfuscated);

        let mut input = std::fs::File::open(plaintext_path)?;
        let mut output = std::fs::File::create(&dest)?;
        encrypt_senc(&key, &mut input, &mut output)?;
        output.sync_all()?;

        let manifest_path = self.manifest_path(relative_folder);
        let mut manifest = read_manifest(&manifest_path, &key)?;
        manifest.insert(obfuscated.clone(), original_name.to_string());
        write_manifest(&manifest_path, &key, &manifest)?;

        std::fs::remove_file(plaintext_path)?;
        tracing::debug!(target: "swarm::vault", "encrypted {} as {}", original_name, obfuscated);
        Ok(obfuscated)
    }

    /// Decrypt one vault entry into `out`.
    pub fn decrypt_file<W: Write>(
        &self,
        relative_folder: &str,
        obfuscated_name: &str,
        out: &mut W,
    ) -> SyncResult<()> {
        let key = self.key_for(relative_folder)?;
        let path = self.folder_abs(relative_folder).join(obfuscated_name);
        let mut input = std::fs::File::open(&path)?;
        decrypt_senc(&key, &mut input, out)
    }

    /// Decrypt an entry addressed by its real (manifest) name.
    pub fn decrypt_by_real_name(
        &self,
        relative_folder: &str,
        real_name: &str,
    ) -> SyncResult<Vec<u8>> {
        let key = self.key_for(relative_folder)?;
        let manifest = read_manifest(&self.manifest_path(relative_folder), &key)?;
        let obfuscated = manifest
            .iter()
            .find(|(_, real)| real.as_str() == real_name)
            .map(|(obf, _)| obf.clone())
            .ok_or_else(|| {
                SyncError::Encryption(format!("no vault entry named {}", real_name))
            })?;
        let mut out = Vec::new();
        self.decrypt_file(relative_folder, &obfuscated, &mut out)?;
        Ok(out)
    }

    /// Current manifest mapping obfuscated → real names.
    pub fn manifest(&self, relative_folder: &str) -> SyncResult<BTreeMap<String, String>> {
        let key = self.key_for(relative_folder)?;
        read_manifest(&self.manifest_path(relative_folder), &key)
    }

    /// Lock folders idle past the auto-lock deadline; returns the folders
    /// locked by this pass so the caller can emit `FolderAutoLocked`.
    pub fn auto_lock_tick(&self) -> Vec<String> {
        if self.auto_lock_minutes == 0 {
            return Vec::new();
        }
        let deadline = now_ms() - (self.auto_lock_minutes as i64) * 60_000;
        let mut locked = Vec::new();
        let mut folders = self.folders.lock().unwrap();
        for (name, folder) in folders.iter_mut() {
            if !folder.locked() && folder.last_accessed_ms < deadline {
                folder.lock();
                locked.push(name.clone());
            }
        }
        locked
    }
}

// ---------------------------------------------------------------------------
// SENC container
// ---------------------------------------------------------------------------

/// Encrypt a stream into the SENC container format.
pub fn encrypt_senc<R: Read, W: Write>(key: &[u8; 32], input: &mut R, out: &mut W) -> SyncResult<()> {
    out.write_all(SENC_MAGIC)?;
    out.write_all(&SENC_VERSION.to_be_bytes())?;
    out.write_all(&CHUNK_SIZE_KB.to_be_bytes())?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = input.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let sealed = crypto::seal_chunk(key, &buf[..filled], &[])?;
        out.write_all(&(sealed.len() as u32).to_be_bytes())?;
        out.write_all(&sealed)?;
        if filled < CHUNK_SIZE {
            break;
        }
    }
    Ok(())
}

/// Decrypt a SENC container; any tampering fails the chunk tag check.
pub fn decrypt_senc<R: Read, W: Write>(key: &[u8; 32], input: &mut R, out: &mut W) -> SyncResult<()> {
    let mut header = [0u8; 8];
    input
        .read_exact(&mut header)
        .map_err(|_| SyncError::Encryption("truncated SENC header".to_string()))?;
    if &header[..4] != SENC_MAGIC {
        return Err(SyncError::Encryption("bad SENC magic".to_string()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != SENC_VERSION {
        return Err(SyncError::Encryption(format!("unsupported SENC version {}", version)));
    }
    let chunk_kb = u16::from_be_bytes([header[6], header[7]]);
    if chunk_kb != CHUNK_SIZE_KB {
        return Err(SyncError::Encryption(format!("unsupported SENC chunk size {} KiB", chunk_kb)));
    }

    let mut len_bytes = [0u8; 4];
    loop {
        match input.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < crypto::NONCE_LEN + crypto::TAG_LEN || len > CHUNK_SIZE + crypto::NONCE_LEN + crypto::TAG_LEN
        {
            return Err(SyncError::Encryption(format!("implausible SENC chunk length {}", len)));
        }
        let mut sealed = vec![0u8; len];
        input
            .read_exact(&mut sealed)
            .map_err(|_| SyncError::Encryption("truncated SENC chunk".to_string()))?;
        let plaintext = crypto::open_chunk(key, &sealed, &[])?;
        out.write_all(&plaintext)?;
    }
    Ok(())
}

fn read_manifest(path: &Path, key: &[u8; 32]) -> SyncResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut input = std::fs::File::open(path)?;
    let mut json = Vec::new();
    decrypt_senc(key, &mut input, &mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

fn write_manifest(path: &Path, key: &[u8; 32], manifest: &BTreeMap<String, String>) -> SyncResult<()> {
    let json = serde_json::to_vec(manifest)?;
    let mut output = std::fs::File::create(path)?;
    encrypt_senc(key, &mut std::io::Cursor::new(json), &mut output)?;
    output.sync_all()?;
    Ok(())
}
