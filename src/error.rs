// ===================================================================================================
// Error Handling - Core Error Types for the Sync Daemon
// ===================================================================================================
//
// Structured error types for every component of the daemon. Each variant maps to one
// failure category so callers can branch on kind:
//
// - HandshakeFailed: bad signature, unknown identity, wrong peer ID, timeout
// - PeerConnectionLost: TCP reset or idle timeout; transient, reconnect on next beacon
// - TransferInterrupted: EOF before FileEnd or chunk decrypt failure; may be resumable
// - HashMismatch: received/reconstructed bytes do not hash to the advertised value
// - Encryption: vault locked, wrong password, AEAD tag invalid, malformed header
// - StateStore: SQLite failures; the repository degrades to read-only
// - IgnoredPath: path outside the sync root or illegal name; the event is dropped
//
// Deferrals (schedule window closed, manual pause, low battery) are NOT errors and are
// modeled as engine states, never as `SyncError` values.
//
// ===================================================================================================

use std::error::Error as StdError;
use std::fmt;

/// Error type shared across the sync daemon.
///
/// Low-level I/O errors inside a transfer are converted to `TransferInterrupted`
/// with `resumable` reflecting checkpoint presence. Crypto failures carry a
/// description but never key material.
#[derive(Debug)]
pub enum SyncError {
    /// File system I/O failures: reads, writes, renames, temp files.
    Io(String),

    /// Session establishment failed: invalid signature, untrusted or mismatched
    /// identity, or the 10 s handshake timeout elapsed.
    HandshakeFailed(String),

    /// The TCP connection to a peer dropped or idled out. Transient; the
    /// connection pool reconnects on the next beacon.
    PeerConnectionLost(String),

    /// A file transfer ended before `FileEnd`, or a sealed chunk failed to open.
    TransferInterrupted { path: String, resumable: bool },

    /// Received or reconstructed content does not hash to the expected value.
    /// Not retried automatically.
    HashMismatch { path: String, expected: String, actual: String },

    /// Vault and session cipher failures: locked vault, wrong password,
    /// AEAD tag rejection, malformed SENC header.
    Encryption(String),

    /// SQLite failures in the state repository. After a read error the
    /// repository enters a degraded read-only state.
    StateStore(String),

    /// Path outside the sync root or an illegal name; the event is dropped
    /// with a warning.
    IgnoredPath(String),

    /// Wire protocol violations: oversized frame, unknown kind, bad payload,
    /// replayed or out-of-order nonce.
    Protocol(String),

    /// Discovery socket could not be bound; retried with backoff.
    BindingFailed(String),

    /// Data encoding failures for beacons, frames, config, or manifests.
    Serialization(String),

    /// Invalid or unloadable configuration.
    Config(String),

    /// An operation waited longer than its budget.
    Timeout(String),
}

impl SyncError {
    /// Whether the failure is transient enough that the caller may retry
    /// after reconnect or backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::PeerConnectionLost(_)
                | SyncError::TransferInterrupted { resumable: true, .. }
                | SyncError::BindingFailed(_)
                | SyncError::Timeout(_)
        )
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "IO error: {}", e),
            SyncError::HandshakeFailed(e) => write!(f, "Handshake failed: {}", e),
            SyncError::PeerConnectionLost(e) => write!(f, "Peer connection lost: {}", e),
            SyncError::TransferInterrupted { path, resumable } => write!(
                f,
                "Transfer interrupted for {} ({})",
                path,
                if *resumable { "resumable" } else { "not resumable" }
            ),
            SyncError::HashMismatch { path, expected, actual } => write!(
                f,
                "Hash mismatch for {}: expected {}, got {}",
                path, expected, actual
            ),
            SyncError::Encryption(e) => write!(f, "Encryption error: {}", e),
            SyncError::StateStore(e) => write!(f, "State store error: {}", e),
            SyncError::IgnoredPath(e) => write!(f, "Ignored path: {}", e),
            SyncError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SyncError::BindingFailed(e) => write!(f, "Binding failed: {}", e),
            SyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SyncError::Config(e) => write!(f, "Configuration error: {}", e),
            SyncError::Timeout(e) => write!(f, "Timed out: {}", e),
        }
    }
}

impl StdError for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::Io(error.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        SyncError::StateStore(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(error: bincode::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for SyncError {
    fn from(error: hex::FromHexError) -> Self {
        SyncError::Serialization(format!("hex decode error: {}", error))
    }
}

impl From<aes_gcm::Error> for SyncError {
    fn from(_: aes_gcm::Error) -> Self {
        SyncError::Encryption("AEAD operation failed".to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for SyncError {
    fn from(error: ed25519_dalek::SignatureError) -> Self {
        SyncError::HandshakeFailed(format!("signature error: {}", error))
    }
}

/// Result type alias used throughout the daemon.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::PeerConnectionLost("reset".into()).is_transient());
        assert!(SyncError::TransferInterrupted { path: "a".into(), resumable: true }.is_transient());
        assert!(!SyncError::TransferInterrupted { path: "a".into(), resumable: false }.is_transient());
        assert!(!SyncError::HashMismatch {
            path: "a".into(),
            expected: "00".into(),
            actual: "ff".into()
        }
        .is_transient());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::Io(_)));
    }
}
