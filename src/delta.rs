//! Delta construction: rsync-style chunk matching of a target file against a
//! basis signature.
//!
//! 1. Slide a chunk-sized window over the target, updating the rolling
//!    checksum in O(1) per byte.
//! 2. On a rolling-checksum hit, confirm with a strong hash (the rolling
//!    checksum alone is not collision-free).
//! 3. Emit `Copy` for confirmed matches (skipping ahead a whole chunk),
//!    accumulate unmatched bytes into a pending literal flushed as `Data`.

use std::path::Path;

use crate::container::{self, Delta, DeltaOp, FORMAT_VERSION};
use crate::error::DeltaError;
use crate::rolling_hash;
use crate::signature::{
    ChunkSignature, Signature, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::util;

/// Compute a delta that transforms the file described by `signature` into
/// `target`. The delta header records the strong hash of the whole target for
/// post-application verification.
pub fn build_delta(target: &[u8], signature: &Signature) -> Delta {
    let chunk_size = signature.chunk_size as usize;
    let mut ops: Vec<DeltaOp> = Vec::new();
    let mut literal: Vec<u8> = Vec::new();

    if target.len() >= chunk_size && !signature.chunks.is_empty() {
        let mut pos = 0usize;
        let mut rolling = rolling_hash::compute(&target[..chunk_size]);

        while pos + chunk_size <= target.len() {
            let window = &target[pos..pos + chunk_size];

            if let Some(chunk) = find_match(rolling, window, signature) {
                if !literal.is_empty() {
                    ops.push(DeltaOp::Data {
                        bytes: std::mem::take(&mut literal),
                    });
                }
                push_copy(&mut ops, chunk.start, chunk.length as u64);

                pos += chunk_size;
                if pos + chunk_size <= target.len() {
                    rolling = rolling_hash::compute(&target[pos..pos + chunk_size]);
                }
            } else {
                literal.push(target[pos]);
                pos += 1;
                if pos + chunk_size <= target.len() {
                    rolling = rolling_hash::rotate(
                        rolling,
                        target[pos - 1],
                        target[pos + chunk_size - 1],
                        signature.chunk_size,
                    );
                }
            }
        }

        // Trailing bytes shorter than one window never chunk-match.
        if pos < target.len() {
            literal.extend_from_slice(&target[pos..]);
        }
    } else {
        literal.extend_from_slice(target);
    }

    if !literal.is_empty() {
        ops.push(DeltaOp::Data { bytes: literal });
    }

    Delta {
        version: FORMAT_VERSION,
        hash_algorithm: signature.hash_algorithm.clone(),
        checksum_algorithm: signature.checksum_algorithm.clone(),
        chunk_size: signature.chunk_size,
        final_hash: *blake3::hash(target).as_bytes(),
        ops,
    }
}

/// Build deltas for a small set of chunk sizes (the default, halved down to
/// the minimum, then doubled up to the maximum) and keep whichever encodes
/// smallest. A local search, not a global optimum.
pub fn build_delta_best(basis: &[u8], target: &[u8]) -> Result<Delta, DeltaError> {
    let mut best: Option<(u64, Delta)> = None;

    for chunk_size in candidate_chunk_sizes() {
        let signature = Signature::build(basis, chunk_size)?;
        let delta = build_delta(target, &signature);
        let encoded = container::encoded_len(&delta)?;

        match &best {
            Some((size, _)) if *size <= encoded => {}
            _ => best = Some((encoded, delta)),
        }
    }

    // candidate_chunk_sizes is never empty.
    Ok(best.expect("at least one candidate chunk size").1)
}

/// Diff two files on disk and write the resulting delta container.
pub fn create_delta_file(
    basis_path: &Path,
    target_path: &Path,
    delta_path: &Path,
) -> Result<(), DeltaError> {
    let basis = util::mmap_file(basis_path)?;
    let target = util::mmap_file(target_path)?;
    let delta = build_delta_best(&basis, &target)?;
    container::write_container(delta_path, container::DELTA_MAGIC, &delta)
}

fn candidate_chunk_sizes() -> Vec<u32> {
    let mut sizes = vec![DEFAULT_CHUNK_SIZE];
    let mut down = DEFAULT_CHUNK_SIZE / 2;
    while down >= MIN_CHUNK_SIZE {
        sizes.push(down);
        down /= 2;
    }
    let mut up = DEFAULT_CHUNK_SIZE * 2;
    while up <= MAX_CHUNK_SIZE {
        sizes.push(up);
        up *= 2;
    }
    sizes
}

/// Confirm a rolling-checksum candidate with a strong-hash comparison.
/// Only full-length chunks can match a full window.
fn find_match<'a>(
    rolling: u32,
    window: &[u8],
    signature: &'a Signature,
) -> Option<&'a ChunkSignature> {
    let candidates = signature.candidates(rolling);
    if candidates.is_empty() {
        return None;
    }

    let strong = *blake3::hash(window).as_bytes();
    candidates
        .iter()
        .find(|c| c.length as usize == window.len() && c.strong == strong)
}

/// Append a copy operation, merging with the previous one when the basis
/// ranges are contiguous.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, length: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, length });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_delta;
    use std::io::Cursor;

    fn round_trip(basis: &[u8], target: &[u8], chunk_size: u32) -> Delta {
        let signature = Signature::build(basis, chunk_size).unwrap();
        let delta = build_delta(target, &signature);

        let mut out = Vec::new();
        apply_delta(&mut Cursor::new(basis), &delta, &mut out).unwrap();
        assert_eq!(out, target, "round trip failed for chunk size {chunk_size}");
        delta
    }

    #[test]
    fn identical_data_is_one_merged_copy() {
        let data: Vec<u8> = (0..4096u32 * 3).map(|i| (i % 251) as u8).collect();
        let delta = round_trip(&data, &data, 4096);
        assert_eq!(delta.ops.len(), 1);
        assert!(matches!(
            delta.ops[0],
            DeltaOp::Copy { offset: 0, length } if length == data.len() as u64
        ));
    }

    #[test]
    fn empty_basis_forces_all_literal() {
        let target = vec![1u8; 10_000];
        let delta = round_trip(&[], &target, 4096);
        assert_eq!(delta.ops.len(), 1);
        assert!(matches!(delta.ops[0], DeltaOp::Data { .. }));
    }

    #[test]
    fn empty_target() {
        let basis = vec![1u8; 100];
        let delta = round_trip(&basis, &[], 4096);
        assert!(delta.ops.is_empty());
    }

    #[test]
    fn completely_different_data() {
        let basis = vec![0u8; 4096 * 2];
        let target = vec![1u8; 4096 * 2];
        round_trip(&basis, &target, 4096);
    }

    #[test]
    fn prefix_change_keeps_copies_for_the_rest() {
        let basis: Vec<u8> = (0..4096u32 * 4).map(|i| (i % 256) as u8).collect();
        let mut target = basis.clone();
        for b in target[..4096].iter_mut() {
            *b = 0xFF;
        }

        let delta = round_trip(&basis, &target, 4096);
        let copied: u64 = delta
            .ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { length, .. } => *length,
                DeltaOp::Data { .. } => 0,
            })
            .sum();
        assert_eq!(copied, 4096 * 3);
    }

    #[test]
    fn insertion_in_the_middle() {
        let basis: Vec<u8> = (0..4096u32 * 4).map(|i| (i % 256) as u8).collect();
        let mut target = basis.clone();
        target.splice(4096 * 2..4096 * 2, vec![0xAA; 100]);
        round_trip(&basis, &target, 4096);
    }

    #[test]
    fn round_trip_across_chunk_size_range() {
        let basis: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 253) as u8).collect();
        let mut target = basis.clone();
        target.splice(10_000..10_000, vec![9u8; 777]);
        target.truncate(35_000);

        for chunk_size in candidate_chunk_sizes() {
            round_trip(&basis, &target, chunk_size);
        }
    }

    #[test]
    fn target_shorter_than_one_chunk() {
        let basis = vec![3u8; 4096 * 2];
        round_trip(&basis, b"tiny", 4096);
    }

    #[test]
    fn best_delta_round_trips() {
        let basis: Vec<u8> = (0..30_000u32).map(|i| (i % 256) as u8).collect();
        let mut target = basis.clone();
        target.extend_from_slice(&[0xEE; 500]);

        let delta = build_delta_best(&basis, &target).unwrap();
        let mut out = Vec::new();
        apply_delta(&mut Cursor::new(&basis), &delta, &mut out).unwrap();
        assert_eq!(out, target);
    }
}
