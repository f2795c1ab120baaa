/// Cryptographic Primitives Module
///
/// Everything the daemon needs from cryptography lives here:
/// - Ed25519 identity keypairs (long-lived, advertised in beacons and handshakes)
/// - X25519 ephemeral session exchange with HKDF-SHA256 key derivation
/// - AES-256-GCM chunk sealing in the `nonce ‖ ciphertext ‖ tag` layout
/// - PBKDF2-HMAC-SHA256 password key derivation for vault folders
/// - Streamed SHA-256 file hashing (canonical lowercase hex)
/// - The Adler-style 32-bit rolling checksum used by the delta engine
///
/// All functions are pure with respect to daemon state; no shared mutable
/// state is held here.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroize;

use crate::error::{SyncError, SyncResult};

/// Context string mixed into the session key derivation.
const SESSION_INFO: &[u8] = b"swarm-session-v1";

/// PBKDF2 iteration count for vault password keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Buffer size for streamed file hashing.
const HASH_BUF_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Identity keys
// ---------------------------------------------------------------------------

/// Long-lived Ed25519 identity keypair for this device.
///
/// The private half is persisted through the `KeyStorage` interface; the
/// public half travels in discovery beacons and handshake records.
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a fresh identity keypair.
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    /// Rebuild a keypair from the stored 32-byte private key.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::Encryption("identity key must be 32 bytes".to_string()))?;
        Ok(Self { signing: SigningKey::from_bytes(&arr) })
    }

    /// The 32-byte private key for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The 32-byte public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Fingerprint of the public key: SHA-256 of the raw 32 bytes, hex.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_bytes())
    }
}

/// Fingerprint an identity public key. Trust records match on this value.
pub fn fingerprint(public_key: &[u8]) -> String {
    sha256_hex(public_key)
}

/// Verify an Ed25519 signature against a raw 32-byte public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> SyncResult<()> {
    let arr: [u8; 32] = public_key
        .try_into()
        .map_err(|_| SyncError::HandshakeFailed("public key must be 32 bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&arr)?;
    let sig = Signature::from_slice(signature)?;
    key.verify(message, &sig)
        .map_err(|_| SyncError::HandshakeFailed("invalid handshake signature".to_string()))
}

// ---------------------------------------------------------------------------
// Session key exchange
// ---------------------------------------------------------------------------

/// One side of an ephemeral X25519 exchange. Created per handshake and
/// consumed when the remote public key arrives; the secret never outlives
/// the exchange.
pub struct SessionExchange {
    secret: Option<EphemeralSecret>,
    public: X25519Public,
}

impl SessionExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret: Some(secret), public }
    }

    /// Our ephemeral public key, sent in the handshake record.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Complete the exchange against the remote ephemeral public key and
    /// derive the 32-byte session key. The two peer IDs are sorted so both
    /// sides derive the same key.
    pub fn derive(
        &mut self,
        their_public: &[u8],
        local_peer: &[u8; 16],
        remote_peer: &[u8; 16],
    ) -> SyncResult<SessionKey> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| SyncError::HandshakeFailed("session exchange already completed".to_string()))?;
        let arr: [u8; 32] = their_public
            .try_into()
            .map_err(|_| SyncError::HandshakeFailed("ephemeral key must be 32 bytes".to_string()))?;
        let shared = secret.diffie_hellman(&X25519Public::from(arr));

        let (first, second) = if local_peer <= remote_peer {
            (local_peer, remote_peer)
        } else {
            (remote_peer, local_peer)
        };
        let mut info = Vec::with_capacity(SESSION_INFO.len() + 32);
        info.extend_from_slice(SESSION_INFO);
        info.extend_from_slice(first);
        info.extend_from_slice(second);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(&info, &mut key)
            .map_err(|_| SyncError::Encryption("HKDF expand failed".to_string()))?;
        Ok(SessionKey::new(key))
    }
}

impl Default for SessionExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// A 32-byte symmetric key, zeroed when dropped.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("SessionKey(..)")
    }
}

// ---------------------------------------------------------------------------
// AEAD chunks
// ---------------------------------------------------------------------------

/// Encrypt one chunk with a fresh random nonce. Output layout is
/// `nonce ‖ ciphertext ‖ tag`.
pub fn seal_chunk(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> SyncResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_chunk_with_nonce(key, &nonce, plaintext, aad)
}

/// Encrypt one chunk under a caller-provided nonce (session framing uses
/// counter-derived nonces).
pub fn seal_chunk_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> SyncResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce ‖ ciphertext ‖ tag` chunk. Any tampering, truncation, or
/// wrong key fails the tag check.
pub fn open_chunk(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> SyncResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(SyncError::Encryption("sealed chunk too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })?;
    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Password KDF
// ---------------------------------------------------------------------------

/// Derive a 32-byte key from a vault password and its stored salt.
pub fn derive_password_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 of a byte slice as canonical lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streamed SHA-256 of a file, 64 KiB reads. Returns lowercase hex.
pub fn sha256_file(path: &Path) -> SyncResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_LEN];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Incremental SHA-256 for transfers that hash while writing chunks.
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Rolling checksum
// ---------------------------------------------------------------------------

/// Largest prime below 2^16, the Adler modulus.
const ROLLING_MOD: u64 = 65_521;

/// Adler-style 32-bit rolling checksum over a fixed window.
///
/// `s1` is the byte sum, `s2` the position-weighted sum (first byte weighted
/// `n`, last weighted 1); the exposed value is `(s2 << 16) | s1`. `roll`
/// shifts the window one byte in O(1).
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    s1: u64,
    s2: u64,
    window_len: u64,
}

impl RollingChecksum {
    /// Checksum over an initial window.
    pub fn new(window: &[u8]) -> Self {
        let n = window.len() as u64;
        let mut s1: u64 = 0;
        let mut s2: u64 = 0;
        for (i, &b) in window.iter().enumerate() {
            s1 = (s1 + b as u64) % ROLLING_MOD;
            s2 = (s2 + (n - i as u64) * b as u64) % ROLLING_MOD;
        }
        Self { s1, s2, window_len: n }
    }

    /// Slide the window one byte: `out` leaves the front, `inn` enters the back.
    pub fn roll(&mut self, out: u8, inn: u8) {
        let n = self.window_len;
        self.s1 = (self.s1 + ROLLING_MOD - out as u64 + inn as u64) % ROLLING_MOD;
        self.s2 =
            (self.s2 + ROLLING_MOD - (n * out as u64) % ROLLING_MOD + self.s1) % ROLLING_MOD;
    }

    /// The packed 32-bit checksum value.
    pub fn value(&self) -> u32 {
        ((self.s2 as u32) << 16) | self.s1 as u32
    }
}

/// One-shot weak checksum of a block.
pub fn weak_checksum(block: &[u8]) -> u32 {
    RollingChecksum::new(block).value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_sign_verify_roundtrip() {
        let id = IdentityKeypair::generate();
        let msg = b"peer-id and ephemeral key";
        let sig = id.sign(msg);
        verify_signature(&id.public_bytes(), msg, &sig).unwrap();

        // Tampered message fails
        assert!(verify_signature(&id.public_bytes(), b"other", &sig).is_err());
    }

    #[test]
    fn identity_persists_through_bytes() {
        let id = IdentityKeypair::generate();
        let restored = IdentityKeypair::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id.public_bytes(), restored.public_bytes());
        assert_eq!(id.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn session_keys_agree_regardless_of_order() {
        let a_id = [1u8; 16];
        let b_id = [2u8; 16];

        let mut a = SessionExchange::new();
        let mut b = SessionExchange::new();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();

        let ka = a.derive(&b_pub, &a_id, &b_id).unwrap();
        let kb = b.derive(&a_pub, &b_id, &a_id).unwrap();
        assert_eq!(ka.as_bytes(), kb.as_bytes());
    }

    #[test]
    fn session_exchange_is_single_use() {
        let mut a = SessionExchange::new();
        let b = SessionExchange::new();
        let b_pub = b.public_bytes();
        a.derive(&b_pub, &[1u8; 16], &[2u8; 16]).unwrap();
        assert!(a.derive(&b_pub, &[1u8; 16], &[2u8; 16]).is_err());
    }

    #[test]
    fn chunk_seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal_chunk(&key, b"hello chunk", b"aad").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 11 + TAG_LEN);
        let opened = open_chunk(&key, &sealed, b"aad").unwrap();
        assert_eq!(opened, b"hello chunk");
    }

    #[test]
    fn chunk_rejects_wrong_key_and_aad() {
        let key = [7u8; 32];
        let other = [8u8; 32];
        let sealed = seal_chunk(&key, b"secret", b"aad").unwrap();
        assert!(open_chunk(&other, &sealed, b"aad").is_err());
        assert!(open_chunk(&key, &sealed, b"different").is_err());
    }

    #[test]
    fn chunk_rejects_bit_flip() {
        let key = [7u8; 32];
        let mut sealed = seal_chunk(&key, b"secret", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_chunk(&key, &sealed, b"").is_err());
    }

    #[test]
    fn password_kdf_is_deterministic() {
        let salt = [3u8; 16];
        let k1 = derive_password_key("correct horse", &salt);
        let k2 = derive_password_key("correct horse", &salt);
        let k3 = derive_password_key("wrong", &salt);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn sha256_matches_known_vector() {
        // SHA256("Hi\n"), the value scenario S1 pins down.
        assert_eq!(
            sha256_hex(b"Hi\n"),
            "c01a4cfa25cb895cdd0bb25181ba9c1622e93895a6de6f533a7299f70d6b0cfb"
        );
    }

    #[test]
    fn rolling_matches_recompute() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let window = 64;
        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
            let fresh = weak_checksum(&data[start..start + window]);
            assert_eq!(rolling.value(), fresh, "diverged at offset {}", start);
        }
    }

    #[test]
    fn rolling_survives_modulus_wrap() {
        // All-0xff windows push both sums repeatedly across the modulus.
        let data = vec![0xffu8; 8192];
        let window = 4096;
        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
        }
        assert_eq!(rolling.value(), weak_checksum(&data[4095..4095 + window]));
    }

    #[test]
    fn streamed_file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(&data));
    }
}
