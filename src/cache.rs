//! On-disk cache layout: per-product working directories for downloads and
//! staged files, the self-patch instruction script and cursor, a last-used
//! stamp for pruning, and the installed-version marker file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::version::VersionCode;

pub const DEFAULT_CACHE_EXPIRE_DAYS: u64 = 14;

const DOWNLOADS_DIR: &str = "downloads";
const STAGING_DIR: &str = "staging";
const INSTRUCTIONS_FILENAME: &str = "selfpatch.txt";
const CURSOR_FILENAME: &str = "selfpatch.cursor";
const LAST_USED_FILENAME: &str = "last_used";
pub const VERSION_MARKER_EXTENSION: &str = ".version";

/// Working directory for one product under a shared cache root. Sibling
/// directories under the root belong to other products and are only touched
/// by [`CacheLayout::prune_stale_siblings`].
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: impl Into<PathBuf>, product_name: &str) -> CacheLayout {
        let root = cache_root.into();
        let dir = root.join(product_name);
        CacheLayout { root, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.join(DOWNLOADS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    pub fn instructions_path(&self) -> PathBuf {
        self.dir.join(INSTRUCTIONS_FILENAME)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.dir.join(CURSOR_FILENAME)
    }

    fn last_used_path(&self) -> PathBuf {
        self.dir.join(LAST_USED_FILENAME)
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.downloads_dir())?;
        fs::create_dir_all(self.staging_dir())
    }

    pub fn delete(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Stamps this product's cache as recently used (unix seconds).
    pub fn touch_last_used(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        fs::write(self.last_used_path(), now.to_string())
    }

    /// Deletes sibling product caches whose last-used stamp is older than
    /// `max_age_days`. Caches without a readable stamp are left alone; a
    /// concurrent patcher may be mid-write.
    pub fn prune_stale_siblings(&self, max_age_days: u64) -> std::io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let max_age = max_age_days * 24 * 60 * 60;

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || path == self.dir {
                continue;
            }
            let stamp = match fs::read_to_string(path.join(LAST_USED_FILENAME)) {
                Ok(text) => match text.trim().parse::<u64>() {
                    Ok(stamp) => stamp,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if now.saturating_sub(stamp) > max_age {
                tracing::debug!(path = %path.display(), "pruning stale cache");
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(())
    }
}

fn version_marker_path(app_root: &Path, product_name: &str) -> PathBuf {
    app_root.join(format!("{product_name}{VERSION_MARKER_EXTENSION}"))
}

/// Reads the installed-version marker; returns the invalid version when the
/// marker is absent or unreadable.
pub fn read_version_marker(app_root: &Path, product_name: &str) -> VersionCode {
    match fs::read_to_string(version_marker_path(app_root, product_name)) {
        Ok(text) => VersionCode::parse(text.trim()),
        Err(_) => VersionCode::invalid(),
    }
}

pub fn write_version_marker(
    app_root: &Path,
    product_name: &str,
    version: &VersionCode,
) -> std::io::Result<()> {
    fs::create_dir_all(app_root)?;
    fs::write(version_marker_path(app_root, product_name), version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_live_under_product_dir() {
        let layout = CacheLayout::new("/tmp/cache", "app");
        assert_eq!(layout.dir(), Path::new("/tmp/cache/app"));
        assert!(layout.downloads_dir().starts_with(layout.dir()));
        assert!(layout.instructions_path().starts_with(layout.dir()));
    }

    #[test]
    fn version_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!read_version_marker(dir.path(), "app").is_valid());

        let version = VersionCode::parse("1.2.3");
        write_version_marker(dir.path(), "app", &version).unwrap();
        assert_eq!(read_version_marker(dir.path(), "app"), version);
    }

    #[test]
    fn prunes_only_stale_siblings() {
        let root = tempfile::tempdir().unwrap();
        let mine = CacheLayout::new(root.path(), "mine");
        mine.create_dirs().unwrap();
        mine.touch_last_used().unwrap();

        let fresh = CacheLayout::new(root.path(), "fresh");
        fresh.create_dirs().unwrap();
        fresh.touch_last_used().unwrap();

        let stale = CacheLayout::new(root.path(), "stale");
        stale.create_dirs().unwrap();
        fs::write(stale.dir().join(LAST_USED_FILENAME), "100").unwrap();

        // No stamp at all: must survive.
        let unstamped = CacheLayout::new(root.path(), "unstamped");
        unstamped.create_dirs().unwrap();

        mine.prune_stale_siblings(DEFAULT_CACHE_EXPIRE_DAYS).unwrap();
        assert!(mine.dir().exists());
        assert!(fresh.dir().exists());
        assert!(!stale.dir().exists());
        assert!(unstamped.dir().exists());
    }
}
