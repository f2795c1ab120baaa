/// Delta Synchronization Engine
///
/// rsync-style single-file delta transfer: the holder of the base file emits
/// per-block signatures (weak rolling checksum + strong SHA-256); the holder
/// of the new content slides a window over it, matching blocks by weak
/// checksum first and confirming with the strong hash; the result is a
/// stream of COPY/INSERT instructions whose payload concatenation equals the
/// target bytes exactly. Reconstruction reads the base at random and must
/// hash to the advertised content hash or the output is discarded.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::crypto::{weak_checksum, RollingChecksum};
use crate::error::{SyncError, SyncResult};

/// Fixed block size. Both sides must agree or the transfer falls back to a
/// full send.
pub const BLOCK_SIZE: usize = 4096;

/// Literal buffer flush threshold.
const MAX_LITERAL: usize = 64 * 1024;

/// Signature of one base-file block. The last block may be short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub index: u64,
    pub weak: u32,
    pub strong: [u8; 32],
    pub block_size: u32,
}

/// One reconstruction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaInstruction {
    /// Copy `length` bytes starting at `source_index * BLOCK_SIZE` of the base.
    Copy { source_index: u64, length: u32 },
    /// Append literal bytes.
    Insert { bytes: Vec<u8> },
}

impl DeltaInstruction {
    /// Bytes this instruction contributes to the output.
    pub fn output_len(&self) -> u64 {
        match self {
            DeltaInstruction::Copy { length, .. } => *length as u64,
            DeltaInstruction::Insert { bytes } => bytes.len() as u64,
        }
    }
}

fn strong_hash(block: &[u8]) -> [u8; 32] {
    Sha256::digest(block).into()
}

/// Compute block signatures over a base stream.
pub fn compute_signatures<R: Read>(mut reader: R) -> SyncResult<Vec<BlockSignature>> {
    let mut signatures = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut index = 0u64;
    loop {
        // Fill up to one block; short reads only terminate at EOF.
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let block = &buf[..filled];
        signatures.push(BlockSignature {
            index,
            weak: weak_checksum(block),
            strong: strong_hash(block),
            block_size: filled as u32,
        });
        index += 1;
        if filled < BLOCK_SIZE {
            break;
        }
    }
    Ok(signatures)
}

/// Compute the instruction stream that turns the base (described by
/// `signatures`) into `target`.
pub fn compute_delta(target: &[u8], signatures: &[BlockSignature]) -> Vec<DeltaInstruction> {
    // Weak checksum -> candidate blocks, confirmed by strong hash.
    let mut index: HashMap<u32, Vec<&BlockSignature>> = HashMap::new();
    for sig in signatures {
        if sig.block_size as usize == BLOCK_SIZE {
            index.entry(sig.weak).or_default().push(sig);
        }
    }
    // The trailing short block (if any) is matched separately at EOF.
    let short_tail = signatures.last().filter(|s| (s.block_size as usize) < BLOCK_SIZE);

    let mut instructions = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut offset = 0usize;
    let mut rolling: Option<RollingChecksum> = None;

    while target.len() - offset >= BLOCK_SIZE {
        let window = &target[offset..offset + BLOCK_SIZE];
        let weak = match &rolling {
            Some(r) => r.value(),
            None => {
                let r = RollingChecksum::new(window);
                let v = r.value();
                rolling = Some(r);
                v
            }
        };

        let matched = index.get(&weak).and_then(|candidates| {
            let strong = strong_hash(window);
            candidates.iter().find(|sig| sig.strong == strong).copied()
        });

        if let Some(sig) = matched {
            flush_literal(&mut instructions, &mut literal);
            instructions.push(DeltaInstruction::Copy {
                source_index: sig.index,
                length: BLOCK_SIZE as u32,
            });
            offset += BLOCK_SIZE;
            rolling = None;
        } else {
            literal.push(target[offset]);
            if literal.len() >= MAX_LITERAL {
                flush_literal(&mut instructions, &mut literal);
            }
            if target.len() - offset > BLOCK_SIZE {
                if let Some(r) = rolling.as_mut() {
                    r.roll(target[offset], target[offset + BLOCK_SIZE]);
                }
            } else {
                rolling = None;
            }
            offset += 1;
        }
    }

    // Tail shorter than a block: try the base's short final block before
    // literalizing.
    let tail = &target[offset..];
    if !tail.is_empty() {
        if let Some(sig) = short_tail {
            if sig.block_size as usize == tail.len() && strong_hash(tail) == sig.strong {
                flush_literal(&mut instructions, &mut literal);
                instructions.push(DeltaInstruction::Copy {
                    source_index: sig.index,
                    length: sig.block_size,
                });
                flush_literal(&mut instructions, &mut literal);
                return instructions;
            }
        }
        literal.extend_from_slice(tail);
    }
    flush_literal(&mut instructions, &mut literal);
    instructions
}

fn flush_literal(instructions: &mut Vec<DeltaInstruction>, literal: &mut Vec<u8>) {
    if !literal.is_empty() {
        instructions.push(DeltaInstruction::Insert { bytes: std::mem::take(literal) });
    }
}

/// Reconstruct the target by applying `instructions` over a random-access
/// base, writing to `out`. Returns (bytes written, lowercase hex SHA-256 of
/// the output); the caller compares against the advertised content hash and
/// discards on mismatch.
pub fn apply_delta<B, W>(
    base: &mut B,
    instructions: &[DeltaInstruction],
    out: &mut W,
) -> SyncResult<(u64, String)>
where
    B: Read + Seek,
    W: Write,
{
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; BLOCK_SIZE];
    for instruction in instructions {
        match instruction {
            DeltaInstruction::Copy { source_index, length } => {
                let len = *length as usize;
                if len > buf.len() {
                    buf.resize(len, 0);
                }
                base.seek(SeekFrom::Start(source_index * BLOCK_SIZE as u64))?;
                base.read_exact(&mut buf[..len]).map_err(|e| {
                    SyncError::Protocol(format!(
                        "delta copy out of range at block {}: {}",
                        source_index, e
                    ))
                })?;
                out.write_all(&buf[..len])?;
                hasher.update(&buf[..len]);
                total += len as u64;
            }
            DeltaInstruction::Insert { bytes } => {
                out.write_all(bytes)?;
                hasher.update(bytes);
                total += bytes.len() as u64;
            }
        }
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Convenience wrapper for in-memory reconstruction.
pub fn apply_delta_to_vec(base: &[u8], instructions: &[DeltaInstruction]) -> SyncResult<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(base);
    let mut out = Vec::new();
    apply_delta(&mut cursor, instructions, &mut out)?;
    Ok(out)
}

/// Total bytes the instruction stream will produce.
pub fn delta_output_len(instructions: &[DeltaInstruction]) -> u64 {
    instructions.iter().map(DeltaInstruction::output_len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(base: &[u8], target: &[u8]) -> Vec<DeltaInstruction> {
        let sigs = compute_signatures(base).unwrap();
        let delta = compute_delta(target, &sigs);
        let rebuilt = apply_delta_to_vec(base, &delta).unwrap();
        assert_eq!(rebuilt, target, "reconstruction mismatch");
        assert_eq!(delta_output_len(&delta), target.len() as u64);
        delta
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8).collect()
    }

    #[test]
    fn identical_files_are_all_copies() {
        let base = patterned(BLOCK_SIZE * 4, 1);
        let delta = roundtrip(&base, &base);
        assert!(delta.iter().all(|i| matches!(i, DeltaInstruction::Copy { .. })));
        assert_eq!(delta.len(), 4);
    }

    #[test]
    fn append_produces_copies_plus_one_insert() {
        let base = patterned(BLOCK_SIZE * 256, 2);
        let mut target = base.clone();
        target.extend_from_slice(b"tail");

        let delta = roundtrip(&base, &target);
        let copies = delta
            .iter()
            .filter(|i| matches!(i, DeltaInstruction::Copy { .. }))
            .count();
        let inserts: Vec<_> = delta
            .iter()
            .filter_map(|i| match i {
                DeltaInstruction::Insert { bytes } => Some(bytes.len()),
                _ => None,
            })
            .collect();
        assert_eq!(copies, 256);
        assert_eq!(inserts, vec![4]);
    }

    #[test]
    fn prepend_shifts_still_match_blocks() {
        let base = patterned(BLOCK_SIZE * 8, 3);
        let mut target = b"prefix!".to_vec();
        target.extend_from_slice(&base);

        let delta = roundtrip(&base, &target);
        let copied: u64 = delta
            .iter()
            .filter_map(|i| match i {
                DeltaInstruction::Copy { length, .. } => Some(*length as u64),
                _ => None,
            })
            .sum();
        assert_eq!(copied, (BLOCK_SIZE * 8) as u64);
    }

    #[test]
    fn boundary_sizes_roundtrip() {
        for (base_len, target_len) in [
            (0usize, 0usize),
            (0, 1),
            (1, 0),
            (BLOCK_SIZE, BLOCK_SIZE),
            (BLOCK_SIZE - 1, BLOCK_SIZE - 1),
            (BLOCK_SIZE + 1, BLOCK_SIZE + 1),
            (BLOCK_SIZE * 3, BLOCK_SIZE - 1),
            (BLOCK_SIZE - 1, BLOCK_SIZE * 3),
        ] {
            let base = patterned(base_len, 4);
            let target = patterned(target_len, 5);
            roundtrip(&base, &target);
        }
    }

    #[test]
    fn short_final_block_is_reused() {
        // Base ends with a short block; target keeps it verbatim.
        let base = patterned(BLOCK_SIZE * 2 + 100, 6);
        let delta = roundtrip(&base, &base);
        assert_eq!(
            delta.last().unwrap(),
            &DeltaInstruction::Copy { source_index: 2, length: 100 }
        );
    }

    #[test]
    fn signatures_mark_short_tail() {
        let data = patterned(BLOCK_SIZE + 10, 7);
        let sigs = compute_signatures(&data[..]).unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].block_size as usize, BLOCK_SIZE);
        assert_eq!(sigs[1].block_size, 10);
        assert_eq!(sigs[1].index, 1);
    }

    #[test]
    fn empty_base_means_full_insert() {
        let target = patterned(BLOCK_SIZE * 2 + 17, 8);
        let sigs = compute_signatures(&[][..]).unwrap();
        assert!(sigs.is_empty());
        let delta = compute_delta(&target, &sigs);
        assert!(delta.iter().all(|i| matches!(i, DeltaInstruction::Insert { .. })));
        assert_eq!(apply_delta_to_vec(&[], &delta).unwrap(), target);
    }

    #[test]
    fn corrupted_base_fails_hash_check() {
        let base = patterned(BLOCK_SIZE * 4, 9);
        let sigs = compute_signatures(&base[..]).unwrap();
        let delta = compute_delta(&base, &sigs);

        let mut corrupted = base.clone();
        corrupted[10] ^= 0x01;
        let expected = crate::crypto::sha256_hex(&base);
        let mut cursor = std::io::Cursor::new(&corrupted[..]);
        let mut out = Vec::new();
        let (_, actual) = apply_delta(&mut cursor, &delta, &mut out).unwrap();
        assert_ne!(actual, expected);
    }

    #[test]
    fn large_literals_flush_in_chunks() {
        let base = patterned(BLOCK_SIZE, 10);
        // Target shares nothing with the base and exceeds one flush.
        let target = patterned(MAX_LITERAL + 1000, 11)
            .iter()
            .map(|b| b.wrapping_add(128))
            .collect::<Vec<u8>>();
        let sigs = compute_signatures(&base[..]).unwrap();
        let delta = compute_delta(&target, &sigs);
        assert!(delta.len() >= 2);
        for i in &delta {
            if let DeltaInstruction::Insert { bytes } = i {
                assert!(bytes.len() <= MAX_LITERAL);
            }
        }
        assert_eq!(apply_delta_to_vec(&base, &delta).unwrap(), target);
    }
}
