use std::io;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths use forward slashes for cross-platform consistency in manifests.
pub fn walk_directory(root: &Path) -> io::Result<Vec<DirEntry>> {
    let root = root.canonicalize()?;
    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .map_err(|e| io::Error::other(format!("relative path: {e}")))?;

        let relative_str = relative
            .to_str()
            .ok_or_else(|| io::Error::other(format!("non-UTF8 path: {}", relative.display())))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry.metadata().map_err(io::Error::other)?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe { Mmap::map(&file) }
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

pub fn hash_file_hex(path: &Path) -> io::Result<String> {
    Ok(hex::encode(hash_file(path)?.as_bytes()))
}

pub fn hash_bytes_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// A local file is up to date with a manifest entry iff its size matches
/// exactly and, unless it exceeds `hash_ceiling`, its content hash matches.
/// An empty expected hash only requires the size check.
pub fn matches_signature(
    path: &Path,
    expected_size: u64,
    expected_hash_hex: &str,
    hash_ceiling: u64,
) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return false,
    };
    if meta.len() != expected_size {
        return false;
    }
    if expected_hash_hex.is_empty() || expected_size > hash_ceiling {
        return true;
    }
    match hash_file_hex(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected_hash_hex),
        Err(_) => false,
    }
}

/// Move a file, creating the destination's parent directory and falling back
/// to copy+delete when rename crosses filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

/// The drive/filesystem root a path lives on: prefix + root dir on Windows,
/// `/` elsewhere. Used for free-space accounting and rename-vs-copy choices.
pub fn drive_root(path: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push(prefix.as_os_str()),
            Component::RootDir => {
                root.push(Component::RootDir.as_os_str());
                break;
            }
            _ => break,
        }
    }
    if root.as_os_str().is_empty() {
        root.push(Component::RootDir.as_os_str());
    }
    root
}

/// Probe write access by creating (and removing) a scratch file.
pub fn check_write_access(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Join a forward-slash manifest path onto a platform root. Manifest paths
/// are untrusted: any segment that is not a plain name (`..`, `.`, empty,
/// rooted) is dropped so the result always stays inside `root`.
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    use std::path::Component;

    let mut path = root.to_path_buf();
    for piece in relative.split('/') {
        let plain = !piece.is_empty()
            && Path::new(piece)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if plain {
            path.push(piece);
        }
    }
    path
}
