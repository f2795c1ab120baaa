/// Wire Protocol Module
///
/// Framed message layer shared by both ends of a transfer connection. Each
/// frame is `u32 length (BE) ‖ u8 kind ‖ payload` with the length covering
/// kind plus payload and capped at 16 MiB. The first two frames of a
/// connection (Handshake, HandshakeAck) are plaintext; every later payload
/// is sealed under the session key with the kind and total length bound in
/// as associated data.
///
/// Payload records are fixed-schema binary (bincode); discovery beacons are
/// the only JSON on the wire.
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::crypto;
use crate::delta::{BlockSignature, DeltaInstruction};
use crate::error::{SyncError, SyncResult};
use crate::state_store::SyncedFile;

/// Hard cap on `length`: 16 MiB.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Codec-level failures. Converted into `SyncError` at the session layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    Empty,
    #[error("frame length {len} exceeds cap {cap}")]
    Oversized { len: usize, cap: usize },
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for SyncError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Io(e) => SyncError::Io(e.to_string()),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

/// Stable integer tags for every frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Handshake = 1,
    HandshakeAck = 2,
    Manifest = 3,
    FileRequest = 4,
    FileHeader = 5,
    FileChunk = 6,
    FileEnd = 7,
    Delete = 8,
    Rename = 9,
    DirectoryCreate = 10,
    SignaturesRequest = 11,
    Signatures = 12,
    DeltaData = 13,
    Error = 14,
    Ping = 15,
    Pong = 16,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameKind::Handshake,
            2 => FrameKind::HandshakeAck,
            3 => FrameKind::Manifest,
            4 => FrameKind::FileRequest,
            5 => FrameKind::FileHeader,
            6 => FrameKind::FileChunk,
            7 => FrameKind::FileEnd,
            8 => FrameKind::Delete,
            9 => FrameKind::Rename,
            10 => FrameKind::DirectoryCreate,
            11 => FrameKind::SignaturesRequest,
            12 => FrameKind::Signatures,
            13 => FrameKind::DeltaData,
            14 => FrameKind::Error,
            15 => FrameKind::Ping,
            16 => FrameKind::Pong,
            _ => return None,
        })
    }
}

/// One wire frame. The payload is plaintext before sealing and ciphertext
/// after; the codec does not care which.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: FrameKind) -> Self {
        Self { kind, payload: Vec::new() }
    }
}

/// Length-prefixed frame codec for `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized { len, cap: MAX_FRAME_LEN });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame_bytes = src.split_to(len);
        let kind = FrameKind::from_u8(frame_bytes[0])
            .ok_or(FrameError::UnknownKind(frame_bytes[0]))?;
        Ok(Some(Frame { kind, payload: frame_bytes[1..].to_vec() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = 1 + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized { len, cap: MAX_FRAME_LEN });
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(frame.kind as u8);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Associated data binding a sealed payload to its frame kind and total
/// frame length.
pub fn frame_aad(kind: FrameKind, frame_len: u32) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[0] = kind as u8;
    aad[1..].copy_from_slice(&frame_len.to_be_bytes());
    aad
}

/// Session nonce: direction byte followed by an 88-bit big-endian counter
/// filling the remaining 11 bytes. Counter values above 2^88 - 1 are
/// unreachable within a session's lifetime.
pub fn session_nonce(direction: u8, counter: u128) -> [u8; crypto::NONCE_LEN] {
    let mut nonce = [0u8; crypto::NONCE_LEN];
    nonce[0] = direction;
    nonce[1..].copy_from_slice(&counter.to_be_bytes()[5..]);
    nonce
}

/// The 88-bit counter carried in a session nonce.
pub fn nonce_counter(nonce: &[u8; crypto::NONCE_LEN]) -> u128 {
    let mut bytes = [0u8; 16];
    bytes[5..].copy_from_slice(&nonce[1..]);
    u128::from_be_bytes(bytes)
}

// ---------------------------------------------------------------------------
// Payload records
// ---------------------------------------------------------------------------

/// First frame in each direction. The signature covers the raw peer ID bytes
/// followed by the ephemeral public key, under the long-lived identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    pub peer_id: Uuid,
    pub peer_name: String,
    pub ephemeral_public: [u8; 32],
    pub identity_public: [u8; 32],
    pub signature: Vec<u8>,
}

impl HandshakeRecord {
    pub fn new(
        identity: &crypto::IdentityKeypair,
        peer_id: Uuid,
        peer_name: String,
        ephemeral_public: [u8; 32],
    ) -> Self {
        let mut message = Vec::with_capacity(48);
        message.extend_from_slice(peer_id.as_bytes());
        message.extend_from_slice(&ephemeral_public);
        let signature = identity.sign(&message).to_vec();
        Self {
            peer_id,
            peer_name,
            ephemeral_public,
            identity_public: identity.public_bytes(),
            signature,
        }
    }

    /// Check the identity signature over (peer ID ‖ ephemeral key).
    pub fn verify(&self) -> SyncResult<()> {
        let mut message = Vec::with_capacity(48);
        message.extend_from_slice(self.peer_id.as_bytes());
        message.extend_from_slice(&self.ephemeral_public);
        crypto::verify_signature(&self.identity_public, &message, &self.signature)
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.identity_public)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub files: Vec<SyncedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequestPayload {
    pub relative_path: String,
}

/// Announces a file body; `start_offset` is nonzero when resuming onto an
/// existing partial temp file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeaderPayload {
    pub transfer_id: Uuid,
    pub relative_path: String,
    pub size: u64,
    pub content_hash: String,
    pub last_modified_ms: i64,
    pub start_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub transfer_id: Uuid,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEndPayload {
    pub transfer_id: Uuid,
    pub relative_path: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturesRequestPayload {
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturesPayload {
    pub relative_path: String,
    pub block_size: u32,
    pub signatures: Vec<BlockSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub state: SyncedFile,
    pub instructions: Vec<DeltaInstruction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub text: String,
}

/// Encode a payload record as fixed-schema binary.
pub fn encode_payload<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a payload record.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::FileAction;

    #[test]
    fn codec_roundtrip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::new(FrameKind::Manifest, vec![1, 2, 3, 4]);
        codec.encode(frame.clone(), &mut buf).unwrap();

        // Length covers kind + payload
        assert_eq!(&buf[..4], &5u32.to_be_bytes());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(FrameKind::Ping, vec![9; 100]), &mut buf).unwrap();
        let mut partial = buf.split_to(40);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn codec_rejects_oversize_and_unknown() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_u8(FrameKind::Ping as u8);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_signature_binds_id_and_key() {
        let identity = crypto::IdentityKeypair::generate();
        let peer_id = Uuid::new_v4();
        let record = HandshakeRecord::new(&identity, peer_id, "laptop".to_string(), [5u8; 32]);
        record.verify().unwrap();

        // Another peer ID invalidates the signature
        let mut forged = record.clone();
        forged.peer_id = Uuid::new_v4();
        assert!(forged.verify().is_err());

        // A swapped ephemeral key invalidates it too
        let mut swapped = record;
        swapped.ephemeral_public = [6u8; 32];
        assert!(swapped.verify().is_err());
    }

    #[test]
    fn nonce_layout() {
        let nonce = session_nonce(1, 0x0102030405060708);
        assert_eq!(nonce[0], 1);
        // Low counter values leave the high-order counter bytes zero
        assert_eq!(&nonce[1..4], &[0, 0, 0]);
        assert_eq!(&nonce[4..], &0x0102030405060708u64.to_be_bytes());
        assert_eq!(nonce_counter(&nonce), 0x0102030405060708);

        // The full 88-bit width is carried on the wire
        let wide = session_nonce(0, 1u128 << 80);
        assert_eq!(wide[1], 0x01);
        assert_eq!(&wide[2..], &[0u8; 10]);
        assert_eq!(nonce_counter(&wide), 1u128 << 80);
    }

    #[test]
    fn payload_records_roundtrip() {
        let state = SyncedFile {
            relative_path: "dir/file.txt".to_string(),
            content_hash: "ab".repeat(32),
            size: 42,
            last_modified_ms: 1_700_000_000_000,
            action: FileAction::Update,
            source_peer_id: String::new(),
            is_directory: false,
            old_relative_path: None,
        };
        let manifest = ManifestPayload { files: vec![state.clone()] };
        let bytes = encode_payload(&manifest).unwrap();
        let decoded: ManifestPayload = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, manifest);

        let delta = DeltaPayload {
            state,
            instructions: vec![
                DeltaInstruction::Copy { source_index: 0, length: 4096 },
                DeltaInstruction::Insert { bytes: b"tail".to_vec() },
            ],
        };
        let decoded: DeltaPayload = decode_payload(&encode_payload(&delta).unwrap()).unwrap();
        assert_eq!(decoded, delta);
    }
}
