//! Repair method: replace every out-of-date file wholesale from its
//! compressed per-file blob.

use std::time::Instant;

use crate::container::decompress_file;
use crate::error::PatchError;
use crate::events::LogEvent;
use crate::manifest::{VersionItem, COMPRESSED_FILE_EXTENSION};
use crate::patcher::{PatchStage, RunContext};
use crate::util::{join_relative, matches_signature, move_file};

pub(crate) fn run(ctx: &mut RunContext<'_>) -> Result<(), PatchError> {
    ctx.sink.stage(PatchStage::CalculatingFilesToUpdate);
    let items = ctx.files_needing_update();
    if items.is_empty() {
        return Ok(());
    }

    if ctx.config.verify_files_on_server {
        verify_on_server(ctx, &items)?;
    }

    ctx.sink.log(LogEvent::UpdatingFiles { count: items.len() });
    let total = items.len();
    for (index, item) in items.iter().enumerate() {
        ctx.cancel.check()?;
        update_file(ctx, item, index + 1, total)?;
        ctx.sink
            .overall_progress(((index + 1) * 100 / total) as u32, &item.path);
    }
    ctx.sink.log(LogEvent::FilesUpdated {
        succeeded: total,
        total,
    });
    Ok(())
}

fn verify_on_server(ctx: &RunContext<'_>, items: &[&VersionItem]) -> Result<(), PatchError> {
    ctx.sink.stage(PatchStage::VerifyingFilesOnServer);
    for item in items {
        ctx.cancel.check()?;
        let url = ctx
            .info
            .item_download_url(item)
            .ok_or_else(|| PatchError::FileMissingOnServer {
                name: item.path.clone(),
            })?;
        let (exists, size) = ctx.downloader.exists_at(&url)?;
        if !exists {
            return Err(PatchError::FileMissingOnServer {
                name: item.path.clone(),
            });
        }
        // Size 0 means the server did not report one.
        if size > 0 && size != item.compressed_size {
            return Err(PatchError::FileInvalidOnServer {
                name: item.path.clone(),
            });
        }
    }
    Ok(())
}

fn update_file(
    ctx: &RunContext<'_>,
    item: &VersionItem,
    index: usize,
    total: usize,
) -> Result<(), PatchError> {
    let ceiling = ctx.config.hash_check_ceiling;
    let blob = join_relative(
        &ctx.cache.downloads_dir(),
        &format!("{}{}", item.path, COMPRESSED_FILE_EXTENSION),
    );

    if !matches_signature(&blob, item.compressed_size, &item.compressed_hash, ceiling) {
        let url = ctx
            .info
            .item_download_url(item)
            .ok_or_else(|| PatchError::FileMissingOnServer {
                name: item.path.clone(),
            })?;
        ctx.sink.stage(PatchStage::DownloadingFiles);
        ctx.sink.log(LogEvent::DownloadingFile {
            name: item.path.clone(),
            index,
            total,
            bytes: item.compressed_size,
        });
        let started = Instant::now();
        let sink = ctx.sink;
        let name = item.path.clone();
        ctx.downloader.download_file(
            &url,
            &blob,
            item.compressed_size,
            &mut |received, expected| {
                let pct = if expected > 0 {
                    (received * 100 / expected).min(100) as u32
                } else {
                    0
                };
                sink.progress(pct, &name);
            },
            ctx.cancel,
        )?;
        if !matches_signature(&blob, item.compressed_size, &item.compressed_hash, ceiling) {
            return Err(PatchError::CorruptDownload {
                name: item.path.clone(),
            });
        }
        ctx.sink.log(LogEvent::FileDownloaded {
            name: item.path.clone(),
            seconds: started.elapsed().as_secs_f64(),
        });
    }

    ctx.sink.stage(PatchStage::UpdatingFiles);
    ctx.sink.log(LogEvent::UpdatingFile {
        name: item.path.clone(),
        index,
        total,
    });

    let target = ctx.target_path(&item.path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension("patchup-tmp");
    decompress_file(&blob, &tmp)?;
    if !matches_signature(&tmp, item.file_size, &item.hash, ceiling) {
        let _ = std::fs::remove_file(&tmp);
        return Err(PatchError::CorruptDownload {
            name: item.path.clone(),
        });
    }
    move_file(&tmp, &target)?;
    // The blob has served its purpose; reclaim the space.
    let _ = std::fs::remove_file(&blob);
    Ok(())
}
