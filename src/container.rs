//! On-disk containers: every blob this crate ships is a magic header followed
//! by a zstd-compressed bincode body.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DeltaError;
use crate::util;

pub const FORMAT_VERSION: u32 = 1;
pub const ZSTD_LEVEL: i32 = 3;

pub const DELTA_MAGIC: &[u8; 8] = b"PUDELTA1";
pub const PATCH_MAGIC: &[u8; 8] = b"PUPATCH1";
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"PUSNAP01";

/// A binary delta: header identifying the algorithms and chunk size the
/// signature was built with, the strong hash of the whole target file, and the
/// ordered copy/literal operations that reconstruct it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Delta {
    pub version: u32,
    pub hash_algorithm: String,
    pub checksum_algorithm: String,
    pub chunk_size: u32,
    pub final_hash: [u8; 32],
    pub ops: Vec<DeltaOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `length` bytes starting at `offset` in the basis file.
    Copy { offset: u64, length: u64 },
    /// Literal bytes present only in the target file.
    Data { bytes: Vec<u8> },
}

/// Container for one incremental patch: per-file deltas for changed files,
/// whole contents for files the previous version did not have.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchArchive {
    pub version: u32,
    pub entries: Vec<PatchEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PatchEntry {
    Delta { path: String, delta: Delta },
    Full { path: String, data: Vec<u8> },
}

impl PatchEntry {
    pub fn path(&self) -> &str {
        match self {
            PatchEntry::Delta { path, .. } => path,
            PatchEntry::Full { path, .. } => path,
        }
    }
}

/// Container for the installer method: a full snapshot of every file in the
/// target version.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotArchive {
    pub version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// Serialize, compress and write a container to `path`.
pub fn write_container<T: Serialize>(
    path: &Path,
    magic: &[u8; 8],
    value: &T,
) -> Result<(), DeltaError> {
    let body = encode_body(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(magic)?;
    file.write_all(&body)?;
    file.flush()?;
    Ok(())
}

/// Memory-map `path`, check the magic header and stream-decompress the body
/// into bincode (no full decompressed buffer is allocated).
pub fn read_container<T: DeserializeOwned>(path: &Path, magic: &[u8; 8]) -> Result<T, DeltaError> {
    // An empty or truncated file is a format problem, not an I/O one; it also
    // cannot be mmapped.
    if std::fs::metadata(path)?.len() < magic.len() as u64 {
        return Err(DeltaError::Corrupt(format!(
            "{}: container file is truncated",
            path.display()
        )));
    }
    let raw = util::mmap_file(path)?;

    if raw.len() < magic.len() || &raw[..magic.len()] != magic {
        return Err(DeltaError::Corrupt(format!(
            "{}: missing magic header",
            path.display()
        )));
    }

    let decoder = zstd::Decoder::new(&raw[magic.len()..])?;
    bincode::deserialize_from(decoder)
        .map_err(|e| DeltaError::Corrupt(format!("{}: {e}", path.display())))
}

/// Serialized+compressed body size without touching the filesystem. Used by
/// the chunk-size search to compare candidate deltas.
pub fn encoded_len<T: Serialize>(value: &T) -> Result<u64, DeltaError> {
    Ok(encode_body(value)?.len() as u64)
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, DeltaError> {
    let encoded = bincode::serialize(value)
        .map_err(|e| DeltaError::Corrupt(format!("serialize failed: {e}")))?;
    Ok(zstd::bulk::compress(&encoded, ZSTD_LEVEL)?)
}

/// Compress a single file into a standalone zstd blob (the Repair method's
/// per-file download unit).
pub fn compress_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let input = std::fs::File::open(src)?;
    let output = std::fs::File::create(dest)?;
    zstd::stream::copy_encode(
        std::io::BufReader::with_capacity(256 * 1024, input),
        std::io::BufWriter::new(output),
        ZSTD_LEVEL,
    )
}

/// Decompress a standalone zstd blob back into a file.
pub fn decompress_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let input = std::fs::File::open(src)?;
    let output = std::fs::File::create(dest)?;
    zstd::stream::copy_decode(
        std::io::BufReader::with_capacity(256 * 1024, input),
        std::io::BufWriter::new(output),
    )
}
