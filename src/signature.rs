use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::rolling_hash;

/// Strong hash recorded per chunk and over whole files.
pub const STRONG_HASH_NAME: &str = "blake3";

pub const DEFAULT_CHUNK_SIZE: u32 = 4096;
pub const MIN_CHUNK_SIZE: u32 = 128;
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024;

/// Descriptor of one fixed-size chunk of a basis file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSignature {
    pub rolling: u32,
    pub strong: [u8; 32],
    pub start: u64,
    pub length: u32,
}

/// Ordered chunk descriptors for a basis file.
///
/// Chunks are sorted by `(rolling, start)` so candidate lookup during diffing
/// is a binary search; equal rolling checksums are iterated in offset order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub hash_algorithm: String,
    pub checksum_algorithm: String,
    pub chunk_size: u32,
    pub chunks: Vec<ChunkSignature>,
}

impl Signature {
    /// Split `basis` into consecutive `chunk_size` chunks (the final chunk may
    /// be shorter) and record a rolling checksum plus a strong hash per chunk.
    pub fn build<R: Read>(mut basis: R, chunk_size: u32) -> std::io::Result<Signature> {
        assert!(chunk_size > 0, "chunk size must be non-zero");

        let mut chunks = Vec::new();
        let mut buf = vec![0u8; chunk_size as usize];
        let mut start = 0u64;

        loop {
            let filled = read_up_to(&mut basis, &mut buf)?;
            if filled == 0 {
                break;
            }

            let chunk = &buf[..filled];
            chunks.push(ChunkSignature {
                rolling: rolling_hash::compute(chunk),
                strong: *blake3::hash(chunk).as_bytes(),
                start,
                length: filled as u32,
            });
            start += filled as u64;

            if filled < chunk_size as usize {
                break;
            }
        }

        chunks.sort_unstable_by_key(|c| (c.rolling, c.start));

        Ok(Signature {
            hash_algorithm: STRONG_HASH_NAME.to_owned(),
            checksum_algorithm: rolling_hash::ALGORITHM_NAME.to_owned(),
            chunk_size,
            chunks,
        })
    }

    /// All chunks whose rolling checksum equals `rolling`, in offset order.
    pub fn candidates(&self, rolling: u32) -> &[ChunkSignature] {
        let start = self.chunks.partition_point(|c| c.rolling < rolling);
        let end = self.chunks.partition_point(|c| c.rolling <= rolling);
        &self.chunks[start..end]
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
