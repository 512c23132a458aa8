//! Installer method: one full-snapshot archive replacing every out-of-date
//! file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use crate::container::{read_container, SnapshotArchive, SNAPSHOT_MAGIC};
use crate::error::PatchError;
use crate::events::LogEvent;
use crate::manifest::INSTALLER_FILENAME;
use crate::patcher::{PatchStage, RunContext};
use crate::util::{matches_signature, move_file};

pub(crate) fn run(ctx: &mut RunContext<'_>) -> Result<(), PatchError> {
    let descriptor = ctx
        .info
        .installer
        .as_ref()
        .ok_or_else(|| PatchError::Internal("no installer descriptor in the manifest".into()))?;
    let ceiling = ctx.config.hash_check_ceiling;

    let archive_path = ctx.cache.downloads_dir().join(INSTALLER_FILENAME);
    if !matches_signature(
        &archive_path,
        descriptor.patch_size,
        &descriptor.patch_hash,
        ceiling,
    ) {
        let url = ctx
            .info
            .installer_download_url()
            .ok_or_else(|| PatchError::FileMissingOnServer {
                name: INSTALLER_FILENAME.to_owned(),
            })?;
        ctx.sink.stage(PatchStage::DownloadingFiles);
        ctx.sink.log(LogEvent::DownloadingFile {
            name: INSTALLER_FILENAME.to_owned(),
            index: 1,
            total: 1,
            bytes: descriptor.patch_size,
        });
        let started = Instant::now();
        let sink = ctx.sink;
        ctx.downloader.download_file(
            &url,
            &archive_path,
            descriptor.patch_size,
            &mut |received, expected| {
                let pct = if expected > 0 {
                    (received * 100 / expected).min(100) as u32
                } else {
                    0
                };
                sink.progress(pct, INSTALLER_FILENAME);
            },
            ctx.cancel,
        )?;
        if !matches_signature(
            &archive_path,
            descriptor.patch_size,
            &descriptor.patch_hash,
            ceiling,
        ) {
            return Err(PatchError::CorruptDownload {
                name: INSTALLER_FILENAME.to_owned(),
            });
        }
        ctx.sink.log(LogEvent::FileDownloaded {
            name: INSTALLER_FILENAME.to_owned(),
            seconds: started.elapsed().as_secs_f64(),
        });
    }

    ctx.sink.stage(PatchStage::ExtractingFromArchive);
    ctx.sink.log(LogEvent::DecompressingPatch {
        name: INSTALLER_FILENAME.to_owned(),
    });
    let archive: SnapshotArchive = read_container(&archive_path, SNAPSHOT_MAGIC)?;
    let contents: HashMap<&str, &[u8]> = archive
        .files
        .iter()
        .map(|file| (file.path.as_str(), file.data.as_slice()))
        .collect();

    let items = ctx.files_needing_update();
    ctx.sink.stage(PatchStage::UpdatingFiles);
    ctx.sink.log(LogEvent::UpdatingFiles { count: items.len() });
    let total = items.len();
    for (index, item) in items.iter().enumerate() {
        ctx.cancel.check()?;
        let data = contents
            .get(item.path.as_str())
            .ok_or_else(|| PatchError::CorruptDownload {
                name: INSTALLER_FILENAME.to_owned(),
            })?;
        ctx.sink.log(LogEvent::CreatingFile {
            name: item.path.clone(),
            index: index + 1,
            total,
        });

        let target = ctx.target_path(&item.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension("patchup-tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(data)?;
        out.flush()?;
        drop(out);
        if !matches_signature(&tmp, item.file_size, &item.hash, ceiling) {
            let _ = std::fs::remove_file(&tmp);
            return Err(PatchError::CorruptDownload {
                name: INSTALLER_FILENAME.to_owned(),
            });
        }
        move_file(&tmp, &target)?;
        ctx.sink
            .overall_progress(((index + 1) * 100 / total) as u32, &item.path);
    }

    let _ = std::fs::remove_file(&archive_path);
    Ok(())
}
