//! Delta application: reconstruct a target file from a basis file and a
//! delta, sequentially and without holding the basis in memory.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::container::{self, Delta, DeltaOp};
use crate::error::DeltaError;
use crate::rolling_hash;
use crate::signature::STRONG_HASH_NAME;

const COPY_BUF_SIZE: usize = 256 * 1024;

/// Apply `delta` to `basis`, writing the reconstructed target to `out`.
///
/// A copy operation referencing bytes beyond the basis length, or unrecognized
/// algorithm names in the header, is a [`DeltaError::Corrupt`] format error. A
/// reconstructed file that does not hash to the header's recorded hash is a
/// [`DeltaError::HashMismatch`], distinct from I/O failures so callers can
/// decide between re-downloading the delta and discarding the basis.
pub fn apply_delta<B, W>(basis: &mut B, delta: &Delta, out: &mut W) -> Result<(), DeltaError>
where
    B: Read + Seek,
    W: Write,
{
    if delta.hash_algorithm != STRONG_HASH_NAME {
        return Err(DeltaError::Corrupt(format!(
            "unknown hash algorithm '{}'",
            delta.hash_algorithm
        )));
    }
    if delta.checksum_algorithm != rolling_hash::ALGORITHM_NAME {
        return Err(DeltaError::Corrupt(format!(
            "unknown rolling checksum algorithm '{}'",
            delta.checksum_algorithm
        )));
    }

    let basis_len = basis.seek(SeekFrom::End(0))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, length } => {
                if offset.checked_add(*length).map_or(true, |end| end > basis_len) {
                    return Err(DeltaError::Corrupt(format!(
                        "copy range {offset}+{length} exceeds basis length {basis_len}"
                    )));
                }

                basis.seek(SeekFrom::Start(*offset))?;
                let mut remaining = *length;
                while remaining > 0 {
                    let want = remaining.min(buf.len() as u64) as usize;
                    basis.read_exact(&mut buf[..want])?;
                    hasher.update(&buf[..want]);
                    out.write_all(&buf[..want])?;
                    remaining -= want as u64;
                }
            }
            DeltaOp::Data { bytes } => {
                hasher.update(bytes);
                out.write_all(bytes)?;
            }
        }
    }

    out.flush()?;

    if *hasher.finalize().as_bytes() != delta.final_hash {
        return Err(DeltaError::HashMismatch);
    }

    Ok(())
}

/// Read a delta container from disk and apply it, writing the target file.
pub fn apply_delta_file(
    basis_path: &Path,
    delta_path: &Path,
    target_path: &Path,
) -> Result<(), DeltaError> {
    let delta: Delta = container::read_container(delta_path, container::DELTA_MAGIC)?;

    let mut basis = std::fs::File::open(basis_path)?;
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::io::BufWriter::new(std::fs::File::create(target_path)?);

    apply_delta(&mut basis, &delta, &mut out)
}
