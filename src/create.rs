//! Publisher pipeline: turns a built application tree into everything a
//! download server needs — the `VersionInfo` manifest, per-file compressed
//! blobs for the Repair method, a full snapshot for the Installer method and,
//! when the previous version's tree is available, an incremental delta patch.
//!
//! Uses Tokio for concurrent directory walks and Rayon for parallel hashing,
//! compression and diffing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::container::{
    write_container, PatchArchive, PatchEntry, SnapshotArchive, SnapshotFile, FORMAT_VERSION,
    PATCH_MAGIC, SNAPSHOT_MAGIC,
};
use crate::delta::build_delta_best;
use crate::manifest::{
    path_is_ignored, IncrementalPatch, IncrementalPatchInfo, InstallerPatch, PatchItem,
    PatchRenamedItem, VersionInfo, VersionItem, COMPRESSED_FILE_EXTENSION, INSTALLER_FILENAME,
    PATCH_FILE_EXTENSION, PATCH_INFO_EXTENSION, VERSION_INFO_FILENAME,
};
use crate::util::{self, EntryKind};
use crate::version::VersionCode;

pub struct CreateOptions {
    /// Tree of the version being published.
    pub new_dir: PathBuf,
    /// Tree of the previously published version; enables the incremental
    /// patch. Requires `previous_version`.
    pub old_dir: Option<PathBuf>,
    pub previous_version: Option<VersionCode>,
    /// Server output directory; blobs land under it mirroring the tree.
    pub output: PathBuf,
    pub name: String,
    pub version: VersionCode,
    pub base_download_url: String,
    pub maintenance_check_url: String,
    pub ignored_paths: Vec<String>,
    pub skip_installer: bool,
}

#[derive(Debug, Default)]
pub struct CreateSummary {
    pub files: usize,
    pub patched_files: usize,
    pub new_files: usize,
    pub renamed_files: usize,
    pub installer_written: bool,
}

struct HashedFile {
    relative_path: String,
    full_path: PathBuf,
    size: u64,
    hash: String,
}

pub async fn create_release(options: CreateOptions) -> Result<CreateSummary> {
    if !options.version.is_valid() {
        bail!("invalid version code");
    }
    if options.old_dir.is_some() != options.previous_version.is_some() {
        bail!("--old and --previous-version must be given together");
    }
    std::fs::create_dir_all(&options.output)
        .with_context(|| format!("creating {}", options.output.display()))?;

    let ignore: Vec<glob::Pattern> = options
        .ignored_paths
        .iter()
        .filter_map(|raw| glob::Pattern::new(raw).ok())
        .collect();

    // Stage 1: walk both trees concurrently, then hash in parallel.
    let new_files = {
        let dir = options.new_dir.clone();
        tokio::task::spawn_blocking(move || util::walk_directory(&dir)).await??
    };
    let new_hashed = hash_tree(filter_files(new_files, &ignore)).await?;
    if new_hashed.is_empty() {
        bail!("{} contains no files", options.new_dir.display());
    }

    let old_hashed = match &options.old_dir {
        Some(old_dir) => {
            let dir = old_dir.clone();
            let entries =
                tokio::task::spawn_blocking(move || util::walk_directory(&dir)).await??;
            Some(hash_tree(filter_files(entries, &ignore)).await?)
        }
        None => None,
    };

    // Stage 2: Repair blobs — one zstd file per item, mirroring the tree.
    let items = write_repair_blobs(&new_hashed, &options.output).await?;
    let mut summary = CreateSummary {
        files: items.len(),
        ..CreateSummary::default()
    };

    // Stage 3: installer snapshot.
    let installer = if options.skip_installer {
        None
    } else {
        summary.installer_written = true;
        Some(write_installer(&new_hashed, &options.output).await?)
    };

    // Stage 4: incremental patch against the previous tree.
    let mut patch_descriptor = None;
    if let (Some(old_hashed), Some(previous)) = (old_hashed, &options.previous_version) {
        let (descriptor, patched, created, renamed) = write_incremental(
            &old_hashed,
            &new_hashed,
            previous,
            &options.version,
            &options.output,
        )
        .await?;
        summary.patched_files = patched;
        summary.new_files = created;
        summary.renamed_files = renamed;
        patch_descriptor = Some(descriptor);
    }

    // Stage 5: manifest. An existing one keeps its accumulated patch list so
    // older installs can still chain forward.
    let manifest_path = options.output.join(VERSION_INFO_FILENAME);
    let mut info = match VersionInfo::load(&manifest_path) {
        Ok(existing) if existing.name == options.name => existing,
        _ => VersionInfo {
            name: options.name.clone(),
            version: options.version.clone(),
            base_download_url: String::new(),
            maintenance_check_url: String::new(),
            ignored_paths: Vec::new(),
            files: Vec::new(),
            patches: Vec::new(),
            installer: None,
        },
    };
    info.version = options.version.clone();
    info.base_download_url = options.base_download_url.clone();
    info.maintenance_check_url = options.maintenance_check_url.clone();
    info.ignored_paths = options.ignored_paths.clone();
    info.files = items;
    info.installer = installer;
    if let Some(descriptor) = patch_descriptor {
        info.patches.retain(|p| p.label() != descriptor.label());
        info.patches.push(descriptor);
    }
    info.save(&manifest_path)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(summary)
}

fn filter_files(entries: Vec<util::DirEntry>, ignore: &[glob::Pattern]) -> Vec<util::DirEntry> {
    entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::File && !path_is_ignored(ignore, &e.relative_path))
        .collect()
}

async fn hash_tree(entries: Vec<util::DirEntry>) -> Result<Vec<HashedFile>> {
    tokio::task::spawn_blocking(move || {
        let mut hashed = entries
            .par_iter()
            .map(|entry| -> Result<HashedFile> {
                let hash = util::hash_file_hex(&entry.full_path)
                    .with_context(|| format!("hashing {}", entry.full_path.display()))?;
                Ok(HashedFile {
                    relative_path: entry.relative_path.clone(),
                    full_path: entry.full_path.clone(),
                    size: entry.size,
                    hash,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        hashed.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(hashed)
    })
    .await?
}

async fn write_repair_blobs(files: &[HashedFile], output: &Path) -> Result<Vec<VersionItem>> {
    let inputs: Vec<(String, PathBuf, u64, String)> = files
        .iter()
        .map(|f| (f.relative_path.clone(), f.full_path.clone(), f.size, f.hash.clone()))
        .collect();
    let output = output.to_path_buf();

    tokio::task::spawn_blocking(move || {
        inputs
            .par_iter()
            .map(|(relative, full, size, hash)| -> Result<VersionItem> {
                let blob = util::join_relative(
                    &output,
                    &format!("{relative}{COMPRESSED_FILE_EXTENSION}"),
                );
                crate::container::compress_file(full, &blob)
                    .with_context(|| format!("compressing {relative}"))?;
                let compressed_size = std::fs::metadata(&blob)?.len();
                let compressed_hash = util::hash_file_hex(&blob)?;
                Ok(VersionItem {
                    path: relative.clone(),
                    file_size: *size,
                    hash: hash.clone(),
                    compressed_size,
                    compressed_hash,
                    download_url: None,
                })
            })
            .collect()
    })
    .await?
}

async fn write_installer(files: &[HashedFile], output: &Path) -> Result<InstallerPatch> {
    let inputs: Vec<(String, PathBuf)> = files
        .iter()
        .map(|f| (f.relative_path.clone(), f.full_path.clone()))
        .collect();
    let path = output.join(INSTALLER_FILENAME);

    let snapshot_path = path.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let contents = inputs
            .par_iter()
            .map(|(relative, full)| -> Result<SnapshotFile> {
                let data = util::mmap_file(full)?.to_vec();
                Ok(SnapshotFile {
                    path: relative.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let archive = SnapshotArchive {
            version: FORMAT_VERSION,
            files: contents,
        };
        write_container(&snapshot_path, SNAPSHOT_MAGIC, &archive)?;
        Ok(())
    })
    .await??;

    Ok(InstallerPatch {
        patch_size: std::fs::metadata(&path)?.len(),
        patch_hash: util::hash_file_hex(&path)?,
        download_url: None,
    })
}

/// Builds the `from_to.patch` container and its `.info` manifest. Returns the
/// descriptor plus (patched, created, renamed) counts.
async fn write_incremental(
    old_files: &[HashedFile],
    new_files: &[HashedFile],
    from: &VersionCode,
    to: &VersionCode,
    output: &Path,
) -> Result<(IncrementalPatch, usize, usize, usize)> {
    let old_by_path: HashMap<&str, &HashedFile> = old_files
        .iter()
        .map(|f| (f.relative_path.as_str(), f))
        .collect();
    let new_paths: std::collections::HashSet<&str> = new_files
        .iter()
        .map(|f| f.relative_path.as_str())
        .collect();

    // Pure renames: an old-only file and a new-only file with identical
    // content pair up instead of becoming a delete plus a whole new blob.
    let mut orphaned_old: HashMap<(u64, &str), Vec<&HashedFile>> = HashMap::new();
    for old in old_files {
        if !new_paths.contains(old.relative_path.as_str()) {
            orphaned_old
                .entry((old.size, old.hash.as_str()))
                .or_default()
                .push(old);
        }
    }

    let mut renames: Vec<PatchRenamedItem> = Vec::new();
    let mut modified: Vec<(&HashedFile, &HashedFile)> = Vec::new(); // (old, new)
    let mut added: Vec<&HashedFile> = Vec::new();

    for new in new_files {
        match old_by_path.get(new.relative_path.as_str()) {
            Some(old) if old.hash == new.hash => {}
            Some(old) => modified.push((*old, new)),
            None => {
                let orphan = orphaned_old
                    .get_mut(&(new.size, new.hash.as_str()))
                    .and_then(|candidates| candidates.pop());
                match orphan {
                    Some(old) => renames.push(PatchRenamedItem {
                        before_path: old.relative_path.clone(),
                        after_path: new.relative_path.clone(),
                    }),
                    None => added.push(new),
                }
            }
        }
    }

    struct DiffInput {
        relative_path: String,
        old: Option<(PathBuf, u64, String)>,
        new_path: PathBuf,
        new_size: u64,
        new_hash: String,
    }
    let inputs: Vec<DiffInput> = modified
        .iter()
        .map(|(old, new)| DiffInput {
            relative_path: new.relative_path.clone(),
            old: Some((old.full_path.clone(), old.size, old.hash.clone())),
            new_path: new.full_path.clone(),
            new_size: new.size,
            new_hash: new.hash.clone(),
        })
        .chain(added.iter().map(|new| DiffInput {
            relative_path: new.relative_path.clone(),
            old: None,
            new_path: new.full_path.clone(),
            new_size: new.size,
            new_hash: new.hash.clone(),
        }))
        .collect();

    let patched = modified.len();
    let created = added.len();
    let renamed = renames.len();

    let results = tokio::task::spawn_blocking(move || {
        inputs
            .par_iter()
            .map(|input| -> Result<(PatchEntry, PatchItem)> {
                let new_data = util::mmap_file(&input.new_path)?;
                match &input.old {
                    Some((old_path, old_size, old_hash)) => {
                        let old_data = util::mmap_file(old_path)?;
                        let delta = build_delta_best(&old_data, &new_data)
                            .with_context(|| format!("diffing {}", input.relative_path))?;
                        Ok((
                            PatchEntry::Delta {
                                path: input.relative_path.clone(),
                                delta,
                            },
                            PatchItem {
                                path: input.relative_path.clone(),
                                before_size: *old_size,
                                before_hash: old_hash.clone(),
                                after_size: input.new_size,
                                after_hash: input.new_hash.clone(),
                            },
                        ))
                    }
                    None => Ok((
                        PatchEntry::Full {
                            path: input.relative_path.clone(),
                            data: new_data.to_vec(),
                        },
                        PatchItem {
                            path: input.relative_path.clone(),
                            before_size: 0,
                            before_hash: String::new(),
                            after_size: input.new_size,
                            after_hash: input.new_hash.clone(),
                        },
                    )),
                }
            })
            .collect::<Result<Vec<_>>>()
    })
    .await??;

    let (entries, patch_items): (Vec<PatchEntry>, Vec<PatchItem>) = results.into_iter().unzip();

    let label = format!("{from}_{to}");
    let archive_path = output.join(format!("{label}{PATCH_FILE_EXTENSION}"));
    let archive = PatchArchive {
        version: FORMAT_VERSION,
        entries,
    };
    write_container(&archive_path, PATCH_MAGIC, &archive)
        .with_context(|| format!("writing {}", archive_path.display()))?;

    let patch_info = IncrementalPatchInfo {
        renamed_files: renames,
        files: patch_items,
    };
    let info_path = output.join(format!("{label}{PATCH_INFO_EXTENSION}"));
    patch_info
        .save(&info_path)
        .with_context(|| format!("writing {}", info_path.display()))?;

    let descriptor = IncrementalPatch {
        from: from.clone(),
        to: to.clone(),
        file_count: patch_info.files.len() as u32,
        patch_size: std::fs::metadata(&archive_path)?.len(),
        patch_hash: util::hash_file_hex(&archive_path)?,
        info_url: None,
        download_url: None,
    };
    Ok((descriptor, patched, created, renamed))
}
