//! Incremental method: walk the resolved patch chain, applying one delta
//! container per version link.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use crate::apply::apply_delta;
use crate::container::{read_container, PatchArchive, PatchEntry, PATCH_MAGIC};
use crate::error::PatchError;
use crate::events::LogEvent;
use crate::manifest::{
    IncrementalPatch, IncrementalPatchInfo, PatchItem, PATCH_FILE_EXTENSION,
};
use crate::patcher::{PatchStage, RunContext};
use crate::util::{matches_signature, move_file};

pub(crate) fn run(ctx: &mut RunContext<'_>) -> Result<(), PatchError> {
    let chain: Vec<IncrementalPatch> = ctx
        .info
        .resolve_patch_chain(&ctx.root_version)
        .into_iter()
        .cloned()
        .collect();
    if chain.is_empty() {
        return Err(PatchError::Internal(
            "no incremental patch chain from the current version".into(),
        ));
    }

    for patch in &chain {
        ctx.cancel.check()?;
        apply_link(ctx, patch)?;
        ctx.root_version = patch.to.clone();
    }
    Ok(())
}

fn apply_link(ctx: &mut RunContext<'_>, patch: &IncrementalPatch) -> Result<(), PatchError> {
    let label = patch.label();

    let info_url =
        ctx.info
            .patch_info_url(patch)
            .ok_or_else(|| PatchError::FileMissingOnServer {
                name: format!("{label} patch info"),
            })?;
    let mut info_text = ctx.downloader.download_text(&info_url, ctx.cancel)?;
    if let Some(verifier) = &ctx.config.patch_info_verifier {
        if !verifier(&mut info_text) {
            return Err(PatchError::SignatureVerification {
                what: format!("{label} patch info"),
            });
        }
    }
    let patch_info = IncrementalPatchInfo::from_json(&info_text)?;

    let archive_path = download_archive(ctx, patch, &label)?;
    ctx.sink.stage(PatchStage::ExtractingFromArchive);
    ctx.sink.log(LogEvent::DecompressingPatch {
        name: label.clone(),
    });
    let archive: PatchArchive = read_container(&archive_path, PATCH_MAGIC)?;
    let entries: HashMap<&str, &PatchEntry> = archive
        .entries
        .iter()
        .map(|entry| (entry.path(), entry))
        .collect();

    apply_renames(ctx, &patch_info)?;

    ctx.sink.stage(PatchStage::UpdatingFiles);
    ctx.sink.log(LogEvent::UpdatingFiles {
        count: patch_info.files.len(),
    });
    let total = patch_info.files.len();
    let mut skipped = 0usize;
    for (index, item) in patch_info.files.iter().enumerate() {
        ctx.cancel.check()?;
        if !apply_file(ctx, &entries, item, &label, index + 1, total)? {
            skipped += 1;
        }
        ctx.sink
            .overall_progress(((index + 1) * 100 / total.max(1)) as u32, &item.path);
    }
    ctx.sink.log(LogEvent::FilesUpdated {
        succeeded: total - skipped,
        total,
    });

    // The archive is spent once the link has been applied.
    let _ = std::fs::remove_file(&archive_path);
    Ok(())
}

fn download_archive(
    ctx: &RunContext<'_>,
    patch: &IncrementalPatch,
    label: &str,
) -> Result<PathBuf, PatchError> {
    let ceiling = ctx.config.hash_check_ceiling;
    let path = ctx
        .cache
        .downloads_dir()
        .join(format!("{label}{PATCH_FILE_EXTENSION}"));
    if matches_signature(&path, patch.patch_size, &patch.patch_hash, ceiling) {
        return Ok(path);
    }

    let url = ctx
        .info
        .patch_download_url(patch)
        .ok_or_else(|| PatchError::FileMissingOnServer {
            name: label.to_owned(),
        })?;
    ctx.sink.stage(PatchStage::DownloadingFiles);
    ctx.sink.log(LogEvent::DownloadingFile {
        name: label.to_owned(),
        index: 1,
        total: 1,
        bytes: patch.patch_size,
    });
    let started = Instant::now();
    let sink = ctx.sink;
    ctx.downloader.download_file(
        &url,
        &path,
        patch.patch_size,
        &mut |received, expected| {
            let pct = if expected > 0 {
                (received * 100 / expected).min(100) as u32
            } else {
                0
            };
            sink.progress(pct, label);
        },
        ctx.cancel,
    )?;
    if !matches_signature(&path, patch.patch_size, &patch.patch_hash, ceiling) {
        return Err(PatchError::CorruptDownload {
            name: label.to_owned(),
        });
    }
    ctx.sink.log(LogEvent::FileDownloaded {
        name: label.to_owned(),
        seconds: started.elapsed().as_secs_f64(),
    });
    Ok(path)
}

/// Pure renames: executed directly against the install root, or recorded for
/// the self-patch script (with any staged copy moved inside the staging area
/// so later links see it at its new path).
fn apply_renames(
    ctx: &mut RunContext<'_>,
    patch_info: &IncrementalPatchInfo,
) -> Result<(), PatchError> {
    if patch_info.renamed_files.is_empty() {
        return Ok(());
    }
    ctx.sink.log(LogEvent::RenamingFiles {
        count: patch_info.renamed_files.len(),
    });
    for rename in &patch_info.renamed_files {
        ctx.cancel.check()?;
        if ctx.self_patching {
            let staged_before = ctx.target_path(&rename.before_path);
            let staged_after = ctx.target_path(&rename.after_path);
            if staged_before.exists() {
                move_file(&staged_before, &staged_after)?;
            } else {
                // Stage a copy so post-run verification sees the file at its
                // new path; the recorded rename still runs in the root.
                let root_before = ctx.root_path(&rename.before_path);
                if root_before.exists() {
                    if let Some(parent) = staged_after.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&root_before, &staged_after)?;
                }
            }
            ctx.renames.push(rename.clone());
        } else {
            let before = ctx.root_path(&rename.before_path);
            if before.exists() {
                let after = ctx.root_path(&rename.after_path);
                move_file(&before, &after)?;
            }
        }
    }
    Ok(())
}

/// Applies one patched file. Returns false when the file was skipped because
/// its basis does not match the before-state; the post-run verification pass
/// picks those up.
fn apply_file(
    ctx: &RunContext<'_>,
    entries: &HashMap<&str, &PatchEntry>,
    item: &PatchItem,
    label: &str,
    index: usize,
    total: usize,
) -> Result<bool, PatchError> {
    let ceiling = ctx.config.hash_check_ceiling;
    let target = ctx.target_path(&item.path);
    if matches_signature(&target, item.after_size, &item.after_hash, ceiling) {
        ctx.sink.log(LogEvent::FileAlreadyUpToDate {
            name: item.path.clone(),
        });
        return Ok(true);
    }

    let entry = entries
        .get(item.path.as_str())
        .ok_or_else(|| PatchError::CorruptDownload {
            name: label.to_owned(),
        })?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension("patchup-tmp");

    let applied = match entry {
        PatchEntry::Full { data, .. } => {
            ctx.sink.log(LogEvent::CreatingFile {
                name: item.path.clone(),
                index,
                total,
            });
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(data)?;
            out.flush()?;
            true
        }
        PatchEntry::Delta { delta, .. } => {
            ctx.sink.log(LogEvent::UpdatingFile {
                name: item.path.clone(),
                index,
                total,
            });
            let basis = ctx.basis_path(&item.path);
            if !matches_signature(&basis, item.before_size, &item.before_hash, ceiling) {
                // Wrong basis: not corrupt data, just a file this delta does
                // not apply to. Leave it to the verification pass.
                tracing::debug!(path = %item.path, "basis does not match, skipping delta");
                false
            } else {
                let mut basis_file = BufReader::new(File::open(&basis)?);
                let mut out = BufWriter::new(File::create(&tmp)?);
                apply_delta(&mut basis_file, delta, &mut out)?;
                out.flush()?;
                true
            }
        }
    };

    if !applied {
        let _ = std::fs::remove_file(&tmp);
        return Ok(false);
    }
    if !matches_signature(&tmp, item.after_size, &item.after_hash, ceiling) {
        let _ = std::fs::remove_file(&tmp);
        return Err(PatchError::CorruptDownload {
            name: label.to_owned(),
        });
    }
    move_file(&tmp, &target)?;
    Ok(true)
}

