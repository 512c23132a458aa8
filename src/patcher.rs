//! Patch orchestrator: fetches the manifest, picks the cheapest viable patch
//! method, drives download/verify/apply with cascading fallback, and in
//! self-patching mode stages files and hands off to the self-patch executor
//! instead of touching the install root.
//!
//! Each top-level operation runs on a dedicated worker thread; the caller
//! observes it through the event channel and joins it with [`Patcher::wait`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::{
    read_version_marker, write_version_marker, CacheLayout, DEFAULT_CACHE_EXPIRE_DAYS,
};
use crate::cancel::CancelToken;
use crate::download::{
    DownloadHandler, HttpDownloadHandler, MaintenanceLevel, RetryingDownloader,
    DEFAULT_RETRY_BYTES_CAP, DEFAULT_RETRY_COOLDOWN, DEFAULT_RETRY_LIMIT,
};
use crate::error::PatchError;
use crate::events::{Event, EventSink, LogEvent};
use crate::manifest::{
    path_is_ignored, ManifestVerifier, PatchRenamedItem, VersionInfo, VersionItem,
};
use crate::self_patch::SelfPatchScript;
use crate::util::{
    check_write_access, drive_root, join_relative, matches_signature, walk_directory, EntryKind,
};
use crate::version::VersionCode;
use crate::{incremental, installer, repair};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStage {
    CheckingUpdates,
    CheckingFileIntegrity,
    DownloadingFiles,
    ExtractingFromArchive,
    VerifyingFilesOnServer,
    CalculatingFilesToUpdate,
    UpdatingFiles,
    DeletingObsoleteFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMethodKind {
    /// Per-file whole-blob replacement from compressed blobs.
    Repair,
    /// Chain of binary deltas between consecutive versions.
    Incremental,
    /// One full-snapshot archive replacing the whole install.
    Installer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Success,
    AlreadyUpToDate,
}

pub type HandlerFactory = Box<dyn Fn() -> Result<Box<dyn DownloadHandler>, PatchError> + Send + Sync>;
pub type FreeSpaceFn = Box<dyn Fn(&Path) -> std::io::Result<u64> + Send + Sync>;
/// Returns false when another instance of the application is running.
pub type InstanceGuard = Box<dyn Fn() -> bool + Send + Sync>;

pub struct PatcherConfig {
    /// Install root being patched.
    pub root: PathBuf,
    /// URL of the `VersionInfo` manifest.
    pub version_info_url: String,
    /// Cache root; this product's working directory is a subdirectory of it.
    pub cache_root: PathBuf,

    pub use_repair: bool,
    pub use_incremental: bool,
    pub use_installer: bool,
    /// Probe each file's existence and size on the server before repairing.
    pub verify_files_on_server: bool,

    /// Files larger than this are compared by size only, never hashed.
    pub hash_check_ceiling: u64,
    pub cache_expire_days: u64,

    pub retry_limit: u32,
    pub retry_cooldown: Duration,
    pub retry_bytes_cap: u64,

    /// Produces the download transport; defaults to HTTP.
    pub handler_factory: Option<HandlerFactory>,
    /// Verification hook for the raw `VersionInfo` text.
    pub manifest_verifier: Option<ManifestVerifier>,
    /// Verification hook for raw `IncrementalPatchInfo` texts.
    pub patch_info_verifier: Option<ManifestVerifier>,
    /// Free-space probe; defaults to querying the filesystem.
    pub free_space: Option<FreeSpaceFn>,
    pub instance_guard: Option<InstanceGuard>,
}

impl PatcherConfig {
    pub fn new(
        root: impl Into<PathBuf>,
        version_info_url: impl Into<String>,
        cache_root: impl Into<PathBuf>,
    ) -> PatcherConfig {
        PatcherConfig {
            root: root.into(),
            version_info_url: version_info_url.into(),
            cache_root: cache_root.into(),
            use_repair: true,
            use_incremental: true,
            use_installer: true,
            verify_files_on_server: false,
            hash_check_ceiling: u64::MAX,
            cache_expire_days: DEFAULT_CACHE_EXPIRE_DAYS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_cooldown: DEFAULT_RETRY_COOLDOWN,
            retry_bytes_cap: DEFAULT_RETRY_BYTES_CAP,
            handler_factory: None,
            manifest_verifier: None,
            patch_info_verifier: None,
            free_space: None,
            instance_guard: None,
        }
    }
}

/// One orchestrator instance per product. At most one operation may be in
/// flight at a time; a second `run`/`check_for_updates` while one is running
/// returns false.
pub struct Patcher {
    config: Arc<PatcherConfig>,
    cancel: CancelToken,
    tx: Sender<Event>,
    rx: Option<Receiver<Event>>,
    handle: Option<JoinHandle<Result<PatchOutcome, PatchError>>>,
}

impl Patcher {
    pub fn new(config: PatcherConfig) -> Patcher {
        let (tx, rx) = mpsc::channel();
        Patcher {
            config: Arc::new(config),
            cancel: CancelToken::new(),
            tx,
            rx: Some(rx),
            handle: None,
        }
    }

    /// Takes the event receiver; can only be taken once.
    pub fn take_events(&mut self) -> Option<Receiver<Event>> {
        self.rx.take()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Starts an update check on the worker thread. With `check_version_only`
    /// the installed-version marker alone is compared; otherwise every file's
    /// signature is checked against the manifest.
    pub fn check_for_updates(&mut self, check_version_only: bool) -> bool {
        self.spawn(move |worker| worker.check_for_updates(check_version_only))
    }

    /// Starts a full patch run on the worker thread.
    pub fn run(&mut self, self_patching: bool) -> bool {
        self.spawn(move |worker| worker.run(self_patching))
    }

    /// Joins the in-flight operation and returns its result.
    pub fn wait(&mut self) -> Result<PatchOutcome, PatchError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(PatchError::Internal("worker thread panicked".into()))),
            None => Err(PatchError::Internal("no operation in flight".into())),
        }
    }

    fn spawn<F>(&mut self, job: F) -> bool
    where
        F: FnOnce(&Worker) -> Result<PatchOutcome, PatchError> + Send + 'static,
    {
        if self.is_running() {
            return false;
        }
        self.cancel.reset();
        let worker = Worker {
            config: self.config.clone(),
            sink: EventSink::new(self.tx.clone()),
            cancel: self.cancel.clone(),
        };
        self.handle = Some(std::thread::spawn(move || {
            worker.sink.emit(Event::Started);
            let result = job(&worker);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "patch operation failed");
            }
            worker.sink.emit(Event::Finished);
            result
        }));
        true
    }
}

/// Everything the method modules need for one run.
pub(crate) struct RunContext<'a> {
    pub config: &'a PatcherConfig,
    pub info: &'a VersionInfo,
    pub cache: &'a CacheLayout,
    pub downloader: &'a RetryingDownloader,
    pub sink: &'a EventSink,
    pub cancel: &'a CancelToken,
    pub self_patching: bool,
    /// Version the install (or staging area) currently corresponds to;
    /// advanced in memory as incremental links complete.
    pub root_version: VersionCode,
    /// Pure renames collected from applied incremental patches, replayed
    /// against the install root by the self-patch executor.
    pub renames: Vec<PatchRenamedItem>,
}

impl RunContext<'_> {
    pub fn target_dir(&self) -> PathBuf {
        if self.self_patching {
            self.cache.staging_dir()
        } else {
            self.config.root.clone()
        }
    }

    pub fn target_path(&self, relative: &str) -> PathBuf {
        join_relative(&self.target_dir(), relative)
    }

    pub fn root_path(&self, relative: &str) -> PathBuf {
        join_relative(&self.config.root, relative)
    }

    /// A file is up to date when either its staged copy (in self-patching
    /// mode) or its installed copy matches the manifest signature.
    pub fn is_up_to_date(&self, item: &VersionItem) -> bool {
        let ceiling = self.config.hash_check_ceiling;
        if self.self_patching {
            let staged = self.target_path(&item.path);
            if matches_signature(&staged, item.file_size, &item.hash, ceiling) {
                return true;
            }
        }
        matches_signature(&self.root_path(&item.path), item.file_size, &item.hash, ceiling)
    }

    pub fn files_needing_update(&self) -> Vec<&VersionItem> {
        self.info
            .files
            .iter()
            .filter(|item| !self.is_up_to_date(item))
            .collect()
    }

    /// Basis for a delta: prefer an existing staged copy over the installed
    /// one, so chained patches build on each other in self-patching mode.
    pub fn basis_path(&self, relative: &str) -> PathBuf {
        if self.self_patching {
            let staged = self.target_path(relative);
            if staged.is_file() {
                return staged;
            }
        }
        self.root_path(relative)
    }
}

struct Candidate {
    kind: PatchMethodKind,
    cost: u64,
}

struct Worker {
    config: Arc<PatcherConfig>,
    sink: EventSink,
    cancel: CancelToken,
}

impl Worker {
    fn make_downloader(&self) -> Result<RetryingDownloader, PatchError> {
        let handler: Box<dyn DownloadHandler> = match &self.config.handler_factory {
            Some(factory) => factory()?,
            None => Box::new(HttpDownloadHandler::new()?),
        };
        let mut downloader = RetryingDownloader::new(handler);
        downloader.retry_limit = self.config.retry_limit;
        downloader.cooldown = self.config.retry_cooldown;
        downloader.retry_bytes_cap = self.config.retry_bytes_cap;
        Ok(downloader)
    }

    fn fetch_manifest(&self, downloader: &RetryingDownloader) -> Result<VersionInfo, PatchError> {
        self.sink.log(LogEvent::RetrievingVersionInfo);
        let mut text = downloader.download_text(&self.config.version_info_url, &self.cancel)?;
        if let Some(verifier) = &self.config.manifest_verifier {
            if !verifier(&mut text) {
                return Err(PatchError::SignatureVerification {
                    what: "version info".into(),
                });
            }
        }
        let info = VersionInfo::from_json(&text)?;
        if !info.version.is_valid() {
            return Err(PatchError::InvalidVersionCode);
        }

        match downloader.check_maintenance(&info.maintenance_check_url, &self.cancel) {
            MaintenanceLevel::None => {}
            MaintenanceLevel::CanLaunch => {
                return Err(PatchError::UnderMaintenance { can_launch: true })
            }
            MaintenanceLevel::Abort => {
                return Err(PatchError::UnderMaintenance { can_launch: false })
            }
        }

        self.sink.emit(Event::VersionInfoFetched(info.clone()));
        Ok(info)
    }

    fn check_for_updates(&self, check_version_only: bool) -> Result<PatchOutcome, PatchError> {
        self.sink.stage(PatchStage::CheckingUpdates);
        self.sink.log(LogEvent::CheckingForUpdates);

        let downloader = self.make_downloader()?;
        let info = self.fetch_manifest(&downloader)?;
        let installed = read_version_marker(&self.config.root, &info.name);
        self.sink.emit(Event::VersionFetched {
            current: installed.clone(),
            new: info.version.clone(),
        });

        let up_to_date = if check_version_only {
            installed.is_valid() && installed >= info.version
        } else {
            self.sink.stage(PatchStage::CheckingFileIntegrity);
            self.sink.log(LogEvent::CheckingFileIntegrity);
            let ceiling = self.config.hash_check_ceiling;
            info.files.iter().all(|item| {
                matches_signature(
                    &join_relative(&self.config.root, &item.path),
                    item.file_size,
                    &item.hash,
                    ceiling,
                )
            })
        };

        if up_to_date {
            self.sink.log(LogEvent::AppIsUpToDate);
            Ok(PatchOutcome::AlreadyUpToDate)
        } else {
            self.sink.log(LogEvent::UpdateAvailable {
                current: installed,
                new: info.version,
            });
            Ok(PatchOutcome::Success)
        }
    }

    fn run(&self, self_patching: bool) -> Result<PatchOutcome, PatchError> {
        let started = Instant::now();
        self.sink.stage(PatchStage::CheckingUpdates);
        self.sink.log(LogEvent::CheckingForUpdates);

        let downloader = self.make_downloader()?;
        let info = self.fetch_manifest(&downloader)?;
        let cache = CacheLayout::new(&self.config.cache_root, &info.name);

        let installed = read_version_marker(&self.config.root, &info.name);
        // A previous interrupted self-patching run may have left a newer
        // staged tree behind; resume the patch chain from its version. The
        // version the root itself carries stays in `installed` for the
        // self-patch script.
        let mut chain_from = installed.clone();
        if self_patching {
            let staged = read_version_marker(&cache.staging_dir(), &info.name);
            if staged.is_valid() {
                chain_from = staged;
            }
        }
        self.sink.emit(Event::VersionFetched {
            current: installed.clone(),
            new: info.version.clone(),
        });

        let mut ctx = RunContext {
            config: &self.config,
            info: &info,
            cache: &cache,
            downloader: &downloader,
            sink: &self.sink,
            cancel: &self.cancel,
            self_patching,
            root_version: chain_from,
            renames: Vec::new(),
        };

        self.sink.stage(PatchStage::CheckingFileIntegrity);
        self.sink.log(LogEvent::CheckingFileIntegrity);
        // Up to date means the install root itself: staged copies still
        // waiting for the executor don't count, and leftover obsolete files
        // force a pass too.
        let ceiling = self.config.hash_check_ceiling;
        let mut up_to_date = info.files.iter().all(|item| {
            matches_signature(&ctx.root_path(&item.path), item.file_size, &item.hash, ceiling)
        });
        if up_to_date {
            up_to_date = self.obsolete_paths(&ctx)?.is_empty();
        }
        if up_to_date {
            self.sink.log(LogEvent::AppIsUpToDate);
            if !self_patching {
                write_version_marker(&self.config.root, &info.name, &info.version)?;
            }
            return Ok(PatchOutcome::AlreadyUpToDate);
        }
        self.sink.log(LogEvent::UpdateAvailable {
            current: installed.clone(),
            new: info.version.clone(),
        });

        self.preflight(&ctx)?;

        // Everything may already be in place (a staged cache, or only
        // obsolete files to clean up), in which case no method needs to run.
        if !ctx.files_needing_update().is_empty() {
            let candidates = self.candidate_methods(&ctx);
            if candidates.is_empty() {
                return Err(PatchError::NoSuitablePatchMethod);
            }
            self.check_free_space(&ctx, &candidates)?;

            let mut last_err = None;
            let mut succeeded = false;
            for candidate in &candidates {
                self.cancel.check()?;
                self.sink.emit(Event::MethodChanged(candidate.kind));
                self.sink.log(LogEvent::ApplyingMethod(candidate.kind));
                match self.attempt(candidate.kind, &mut ctx) {
                    Ok(()) => {
                        succeeded = true;
                        break;
                    }
                    Err(PatchError::Cancelled) => return Err(PatchError::Cancelled),
                    Err(e) => {
                        self.sink.log(LogEvent::MethodFailed {
                            method: candidate.kind,
                            reason: e.to_string(),
                        });
                        last_err = Some(e);
                    }
                }
            }
            if !succeeded {
                return Err(last_err.unwrap_or(PatchError::NoSuitablePatchMethod));
            }
        }

        // Re-verify everything the attempt claims to have fixed; repair what
        // is still wrong if the manifest allows it.
        self.sink.stage(PatchStage::CheckingFileIntegrity);
        if !ctx.files_needing_update().is_empty() {
            self.sink.log(LogEvent::SomeFilesStillNotUpToDate);
            if self.repair_viable(&ctx) {
                self.sink.emit(Event::MethodChanged(PatchMethodKind::Repair));
                repair::run(&mut ctx)?;
            }
            if !ctx.files_needing_update().is_empty() {
                return Err(PatchError::FilesNotUpToDateAfterPatch);
            }
        }

        if self_patching {
            self.stage_self_patch(&ctx, &installed)?;
        } else {
            self.delete_obsolete_files(&ctx)?;
            write_version_marker(&self.config.root, &info.name, &info.version)?;
            cache.delete()?;
        }

        self.sink.log(LogEvent::PatchCompleted {
            seconds: started.elapsed().as_secs_f64(),
        });
        Ok(PatchOutcome::Success)
    }

    /// Write access, instance guard, cache bookkeeping.
    fn preflight(&self, ctx: &RunContext<'_>) -> Result<(), PatchError> {
        if let Some(guard) = &self.config.instance_guard {
            if !guard() {
                return Err(PatchError::MultipleRunningInstances);
            }
        }

        std::fs::create_dir_all(&self.config.root)?;
        ctx.cache.create_dirs()?;
        if !check_write_access(&self.config.root) {
            return Err(PatchError::RequiresElevatedAccess {
                path: self.config.root.clone(),
            });
        }
        if !check_write_access(ctx.cache.dir()) {
            return Err(PatchError::RequiresElevatedAccess {
                path: ctx.cache.dir().to_path_buf(),
            });
        }

        ctx.cache.touch_last_used()?;
        ctx.cache
            .prune_stale_siblings(self.config.cache_expire_days)?;
        Ok(())
    }

    fn repair_viable(&self, ctx: &RunContext<'_>) -> bool {
        self.config.use_repair
            && !ctx.info.files.is_empty()
            && ctx
                .info
                .files
                .iter()
                .all(|item| item.compressed_size > 0 && !item.compressed_hash.is_empty())
    }

    /// Viable methods with their estimated remaining download bytes, sorted
    /// ascending. The sort is stable and candidates are constructed in
    /// Repair, Incremental, Installer order, which is the tie-break at equal
    /// cost.
    fn candidate_methods(&self, ctx: &RunContext<'_>) -> Vec<Candidate> {
        let ceiling = self.config.hash_check_ceiling;
        let downloads = ctx.cache.downloads_dir();
        let mut candidates = Vec::new();

        if self.repair_viable(ctx) {
            let cost = ctx
                .files_needing_update()
                .iter()
                .filter(|item| {
                    let cached = join_relative(
                        &downloads,
                        &format!("{}{}", item.path, crate::manifest::COMPRESSED_FILE_EXTENSION),
                    );
                    !matches_signature(&cached, item.compressed_size, &item.compressed_hash, ceiling)
                })
                .map(|item| item.compressed_size)
                .sum();
            candidates.push(Candidate {
                kind: PatchMethodKind::Repair,
                cost,
            });
        }

        if self.config.use_incremental {
            let chain = ctx.info.resolve_patch_chain(&ctx.root_version);
            if !chain.is_empty() {
                let cost = chain
                    .iter()
                    .filter(|patch| {
                        let cached = downloads
                            .join(format!("{}{}", patch.label(), crate::manifest::PATCH_FILE_EXTENSION));
                        !matches_signature(&cached, patch.patch_size, &patch.patch_hash, ceiling)
                    })
                    .map(|patch| patch.patch_size)
                    .sum();
                candidates.push(Candidate {
                    kind: PatchMethodKind::Incremental,
                    cost,
                });
            }
        }

        if self.config.use_installer {
            if let Some(installer) = &ctx.info.installer {
                let cached = downloads.join(crate::manifest::INSTALLER_FILENAME);
                let cost = if matches_signature(
                    &cached,
                    installer.patch_size,
                    &installer.patch_hash,
                    ceiling,
                ) {
                    0
                } else {
                    installer.patch_size
                };
                candidates.push(Candidate {
                    kind: PatchMethodKind::Installer,
                    cost,
                });
            }
        }

        candidates.sort_by_key(|c| c.cost);
        for candidate in &candidates {
            self.sink.log(LogEvent::MethodCost {
                method: candidate.kind,
                bytes: candidate.cost,
            });
        }
        candidates
    }

    /// Free-space preflight against the cheapest candidate: the cache drive
    /// holds downloads plus incidental decompressed data (a third extra and a
    /// flat 1 GiB floor), the install drive holds the updated files.
    fn check_free_space(
        &self,
        ctx: &RunContext<'_>,
        candidates: &[Candidate],
    ) -> Result<(), PatchError> {
        let download_bytes = candidates[0].cost;
        let cache_needed = download_bytes + download_bytes / 3 + GIB;
        let install_needed: u64 = ctx
            .files_needing_update()
            .iter()
            .map(|item| item.file_size)
            .sum();

        let cache_drive = drive_root(ctx.cache.dir());
        let install_drive = drive_root(&self.config.root);

        let mut required: Vec<(PathBuf, u64)> = Vec::new();
        if cache_drive == install_drive {
            required.push((cache_drive, cache_needed + install_needed));
        } else {
            required.push((cache_drive, cache_needed));
            required.push((install_drive, install_needed));
        }

        for (drive, needed) in required {
            let available = match &self.config.free_space {
                Some(probe) => probe(&drive)?,
                None => fs4::available_space(&drive)?,
            };
            if available < needed {
                return Err(PatchError::InsufficientSpace {
                    drive,
                    needed,
                    available,
                });
            }
        }
        Ok(())
    }

    fn attempt(&self, kind: PatchMethodKind, ctx: &mut RunContext<'_>) -> Result<(), PatchError> {
        match kind {
            PatchMethodKind::Repair => repair::run(ctx),
            PatchMethodKind::Incremental => incremental::run(ctx),
            PatchMethodKind::Installer => installer::run(ctx),
        }
    }

    /// Files and directories in the install root that the manifest no longer
    /// names and no ignore pattern covers.
    fn obsolete_paths(&self, ctx: &RunContext<'_>) -> Result<Vec<String>, PatchError> {
        self.sink.log(LogEvent::CalculatingObsoleteFiles);
        let keep: HashSet<&str> = ctx.info.files.iter().map(|i| i.path.as_str()).collect();
        let patterns = ctx.info.ignore_patterns();

        let mut obsolete = Vec::new();
        for entry in walk_directory(&self.config.root)? {
            self.cancel.check()?;
            match entry.kind {
                EntryKind::File => {
                    if !keep.contains(entry.relative_path.as_str())
                        && !path_is_ignored(&patterns, &entry.relative_path)
                    {
                        obsolete.push(entry.relative_path);
                    }
                }
                EntryKind::Dir => {
                    let prefix = format!("{}/", entry.relative_path);
                    let still_used = keep.iter().any(|p| p.starts_with(&prefix));
                    if !still_used && !path_is_ignored(&patterns, &entry.relative_path) {
                        obsolete.push(entry.relative_path);
                    }
                }
            }
        }
        Ok(obsolete)
    }

    fn delete_obsolete_files(&self, ctx: &RunContext<'_>) -> Result<(), PatchError> {
        self.sink.stage(PatchStage::DeletingObsoleteFiles);
        let obsolete = self.obsolete_paths(ctx)?;
        if obsolete.is_empty() {
            self.sink.log(LogEvent::NoObsoleteFiles);
            return Ok(());
        }
        self.sink.log(LogEvent::DeletingObsoleteFiles {
            count: obsolete.len(),
        });
        let mut dirs: Vec<PathBuf> = Vec::new();
        for relative in &obsolete {
            self.sink.log(LogEvent::DeletingFile {
                path: relative.clone(),
            });
            let path = ctx.root_path(relative);
            if path.is_dir() {
                dirs.push(path);
            } else if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        // Directories only empty out once the files inside them are gone;
        // deepest first so nested obsolete directories unwind. A directory
        // still holding ignored files stays.
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            let _ = std::fs::remove_dir(&dir);
        }
        Ok(())
    }

    /// Serializes the staged tree into a self-patch instruction script: chain
    /// renames first, then staged-file moves with the version marker last,
    /// then obsolete deletes, then the cache directory itself so the script
    /// cleans up after completion.
    fn stage_self_patch(
        &self,
        ctx: &RunContext<'_>,
        installed: &VersionCode,
    ) -> Result<(), PatchError> {
        let info = ctx.info;
        let staging = ctx.cache.staging_dir();
        write_version_marker(&staging, &info.name, &info.version)?;

        let mut moves: Vec<(PathBuf, PathBuf)> = Vec::new();
        if !ctx.renames.is_empty() {
            self.sink.log(LogEvent::RenamingFiles {
                count: ctx.renames.len(),
            });
            for rename in &ctx.renames {
                moves.push((
                    ctx.root_path(&rename.before_path),
                    ctx.root_path(&rename.after_path),
                ));
            }
        }

        let marker_name = format!("{}{}", info.name, crate::cache::VERSION_MARKER_EXTENSION);
        let mut marker_move = None;
        for entry in walk_directory(&staging)? {
            self.cancel.check()?;
            if entry.kind != EntryKind::File {
                continue;
            }
            let pair = (entry.full_path, join_relative(&self.config.root, &entry.relative_path));
            if entry.relative_path == marker_name {
                marker_move = Some(pair);
            } else {
                moves.push(pair);
            }
        }
        // The marker move runs last: its presence at the destination is what
        // marks the script as completed.
        moves.extend(marker_move);

        let mut deletes: Vec<PathBuf> = self
            .obsolete_paths(ctx)?
            .iter()
            .map(|relative| ctx.root_path(relative))
            .collect();
        deletes.push(ctx.cache.dir().to_path_buf());

        let script = SelfPatchScript {
            installed_version: if installed.is_valid() {
                installed.clone()
            } else {
                VersionCode::zero()
            },
            moves,
            deletes,
        };
        // A fresh script invalidates any cursor left by an older one.
        let _ = std::fs::remove_file(ctx.cache.cursor_path());
        script.save(&ctx.cache.instructions_path())?;
        self.sink.log(LogEvent::ReadyToSelfPatch);
        Ok(())
    }
}
