use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use patchup::cache::{read_version_marker, write_version_marker, CacheLayout};
use patchup::create::{create_release, CreateOptions};
use patchup::download::{DirDownloadHandler, DownloadHandler, ProgressFn};
use patchup::events::Event;
use patchup::manifest::VERSION_INFO_FILENAME;
use patchup::{PatchError, PatchMethodKind, PatchOutcome, Patcher, PatcherConfig, VersionCode};

const PRODUCT: &str = "demo-app";

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    if root.exists() {
        collect_recursive(root, root, &mut entries);
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    for entry in fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_str()
                .unwrap()
                .replace('\\', "/");
            // Bookkeeping the engine writes, not application content.
            if rel.ends_with(".version") {
                continue;
            }
            entries.push((rel, fs::read(&path).unwrap()));
        }
    }
}

/// Deterministic incompressible-ish bytes so deltas and blobs have
/// predictable relative sizes.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

async fn publish(
    server: &Path,
    tree: &Path,
    version: &str,
    old: Option<(&Path, &str)>,
    maintenance_url: &str,
) {
    create_release(CreateOptions {
        new_dir: tree.to_path_buf(),
        old_dir: old.map(|(dir, _)| dir.to_path_buf()),
        previous_version: old.map(|(_, v)| VersionCode::parse(v)),
        output: server.to_path_buf(),
        name: PRODUCT.to_owned(),
        version: VersionCode::parse(version),
        base_download_url: format!("file://{}/", server.display()),
        maintenance_check_url: maintenance_url.to_owned(),
        ignored_paths: vec!["*.cfg".to_owned()],
        skip_installer: false,
    })
    .await
    .unwrap();
}

fn client_config(root: &Path, server: &Path, cache: &Path) -> PatcherConfig {
    let server = server.to_path_buf();
    let mut config = PatcherConfig::new(root, VERSION_INFO_FILENAME, cache);
    config.handler_factory = Some(Box::new(move || {
        Ok(Box::new(DirDownloadHandler::new(server.clone())) as Box<dyn DownloadHandler>)
    }));
    config.retry_limit = 1;
    config.retry_cooldown = Duration::ZERO;
    // Tests must not depend on the build machine's disk.
    config.free_space = Some(Box::new(|_| Ok(u64::MAX)));
    config
}

fn run_update(config: PatcherConfig, self_patching: bool) -> (Result<PatchOutcome, PatchError>, Vec<Event>) {
    let mut patcher = Patcher::new(config);
    let rx = patcher.take_events().unwrap();
    assert!(patcher.run(self_patching));
    let outcome = patcher.wait();
    (outcome, rx.try_iter().collect())
}

fn v1_files() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("app.bin", noise(512 * 1024, 7)),
        ("data/strings.txt", b"alpha beta gamma delta\n".repeat(200)),
        ("notes.txt", b"original notes".to_vec()),
    ]
}

fn write_tree(root: &Path, files: &[(&'static str, Vec<u8>)]) {
    let borrowed: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (*p, c.as_slice())).collect();
    create_dir_tree(root, &borrowed);
}

/// v1.1: app.bin gets a small append, notes.txt is renamed, a new file
/// appears. v1.2: strings.txt changes.
fn v1_1_files() -> Vec<(&'static str, Vec<u8>)> {
    let mut app = noise(512 * 1024, 7);
    app.extend_from_slice(b"hotfix");
    vec![
        ("app.bin", app),
        ("data/strings.txt", b"alpha beta gamma delta\n".repeat(200)),
        ("renamed-notes.txt", b"original notes".to_vec()),
        ("changelog.txt", b"1.1.0: fixes\n".to_vec()),
    ]
}

fn v1_2_files() -> Vec<(&'static str, Vec<u8>)> {
    let mut files = v1_1_files();
    for (path, content) in &mut files {
        if *path == "data/strings.txt" {
            *content = b"alpha beta gamma delta epsilon\n".repeat(210);
        }
    }
    files
}

struct Sandbox {
    _temp: tempfile::TempDir,
    server: PathBuf,
    root: PathBuf,
    cache: PathBuf,
}

async fn sandbox_with_three_versions() -> Sandbox {
    let temp = tempfile::tempdir().unwrap();
    let server = temp.path().join("server");
    let root = temp.path().join("install");
    let cache = temp.path().join("cache");

    let tree_v1 = temp.path().join("tree-1.0.0");
    let tree_v1_1 = temp.path().join("tree-1.1.0");
    let tree_v1_2 = temp.path().join("tree-1.2.0");
    write_tree(&tree_v1, &v1_files());
    write_tree(&tree_v1_1, &v1_1_files());
    write_tree(&tree_v1_2, &v1_2_files());

    publish(&server, &tree_v1, "1.0.0", None, "").await;
    publish(&server, &tree_v1_1, "1.1.0", Some((&tree_v1, "1.0.0")), "").await;
    publish(&server, &tree_v1_2, "1.2.0", Some((&tree_v1_1, "1.1.0")), "").await;

    // Simulate an existing 1.0.0 installation.
    write_tree(&root, &v1_files());
    write_version_marker(&root, PRODUCT, &VersionCode::parse("1.0.0")).unwrap();

    Sandbox {
        _temp: temp,
        server,
        root,
        cache,
    }
}

fn expected_v1_2(temp_root: &Path) -> Vec<(String, Vec<u8>)> {
    let expected_dir = temp_root.join("expected-1.2.0");
    write_tree(&expected_dir, &v1_2_files());
    collect_dir_tree(&expected_dir)
}

#[tokio::test]
async fn end_to_end_two_link_incremental_chain() {
    let sandbox = sandbox_with_three_versions().await;

    let mut config = client_config(&sandbox.root, &sandbox.server, &sandbox.cache);
    config.use_repair = false;
    config.use_installer = false;
    let (outcome, events) = run_update(config, false);
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));

    assert!(events.iter().any(|e| matches!(
        e,
        Event::MethodChanged(PatchMethodKind::Incremental)
    )));
    assert_eq!(
        collect_dir_tree(&sandbox.root),
        expected_v1_2(sandbox._temp.path())
    );
    assert_eq!(
        read_version_marker(&sandbox.root, PRODUCT),
        VersionCode::parse("1.2.0")
    );
    // The cache is removed once the run completes in place.
    assert!(!CacheLayout::new(&sandbox.cache, PRODUCT).dir().exists());
}

#[tokio::test]
async fn second_run_is_already_up_to_date() {
    let sandbox = sandbox_with_three_versions().await;

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::AlreadyUpToDate)));
}

#[tokio::test]
async fn fresh_install_without_chain() {
    let sandbox = sandbox_with_three_versions().await;
    let fresh_root = sandbox._temp.path().join("fresh-install");

    let (outcome, _) = run_update(
        client_config(&fresh_root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert_eq!(
        collect_dir_tree(&fresh_root),
        expected_v1_2(sandbox._temp.path())
    );
}

/// Transport that serves a directory but refuses to deliver incremental
/// patch containers.
struct NoPatchDownloads {
    inner: DirDownloadHandler,
}

impl DownloadHandler for NoPatchDownloads {
    fn download_text(&self, url: &str) -> Result<String, PatchError> {
        self.inner.download_text(url)
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        progress: ProgressFn<'_>,
        cancel: &patchup::cancel::CancelToken,
    ) -> Result<(), PatchError> {
        if url.ends_with(".patch") {
            return Err(PatchError::Download {
                url: url.to_owned(),
                detail: "simulated outage".to_owned(),
            });
        }
        self.inner.download_to(url, dest, expected_size, progress, cancel)
    }

    fn exists_at(&self, url: &str) -> Result<(bool, u64), PatchError> {
        self.inner.exists_at(url)
    }
}

#[tokio::test]
async fn falls_back_to_repair_when_incremental_downloads_fail() {
    let sandbox = sandbox_with_three_versions().await;

    let mut config = client_config(&sandbox.root, &sandbox.server, &sandbox.cache);
    let server = sandbox.server.clone();
    config.handler_factory = Some(Box::new(move || {
        Ok(Box::new(NoPatchDownloads {
            inner: DirDownloadHandler::new(server.clone()),
        }) as Box<dyn DownloadHandler>)
    }));
    // Only app.bin's small append changed vs 1.0.0's 512 KiB of noise, so
    // the delta chain is far cheaper than re-downloading the blobs and
    // Incremental is attempted first.
    config.use_installer = false;

    let (outcome, events) = run_update(config, false);
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::MethodChanged(PatchMethodKind::Incremental)
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::MethodChanged(PatchMethodKind::Repair)
    )));
    assert_eq!(
        collect_dir_tree(&sandbox.root),
        expected_v1_2(sandbox._temp.path())
    );
}

#[tokio::test]
async fn obsolete_directory_trees_are_removed() {
    let sandbox = sandbox_with_three_versions().await;
    fs::create_dir_all(sandbox.root.join("junkdir/sub")).unwrap();
    fs::write(sandbox.root.join("junkdir/top.dat"), b"junk").unwrap();
    fs::write(sandbox.root.join("junkdir/sub/old.dat"), b"junk").unwrap();

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert!(!sandbox.root.join("junkdir").exists());
}

#[tokio::test]
async fn leftover_obsolete_files_force_a_patch_pass() {
    let sandbox = sandbox_with_three_versions().await;

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));

    // All files match the manifest, but a file the manifest no longer names
    // appears; the install is not up to date until it is gone.
    fs::write(sandbox.root.join("leftover.dat"), b"old junk").unwrap();
    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert!(!sandbox.root.join("leftover.dat").exists());

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::AlreadyUpToDate)));
}

#[tokio::test]
async fn obsolete_files_are_removed_but_ignored_ones_survive() {
    let sandbox = sandbox_with_three_versions().await;
    fs::write(sandbox.root.join("leftover.dat"), b"old junk").unwrap();
    fs::write(sandbox.root.join("user.cfg"), b"user settings").unwrap();

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert!(!sandbox.root.join("leftover.dat").exists());
    // "*.cfg" is in the manifest's ignored patterns.
    assert_eq!(
        fs::read(sandbox.root.join("user.cfg")).unwrap(),
        b"user settings"
    );
}

#[tokio::test]
async fn maintenance_flag_aborts_the_run() {
    let sandbox = sandbox_with_three_versions().await;
    // Republish the latest version with a maintenance URL, then raise the flag.
    let tree_v1_2 = sandbox._temp.path().join("tree-1.2.0");
    publish(
        &sandbox.server,
        &tree_v1_2,
        "1.2.0",
        None,
        "maintenance.txt",
    )
    .await;

    fs::write(sandbox.server.join("maintenance.txt"), "10").unwrap();
    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(
        outcome,
        Err(PatchError::UnderMaintenance { can_launch: true })
    ));

    fs::write(sandbox.server.join("maintenance.txt"), "11").unwrap();
    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        false,
    );
    assert!(matches!(
        outcome,
        Err(PatchError::UnderMaintenance { can_launch: false })
    ));
}

#[tokio::test]
async fn recovers_when_staging_finished_but_no_script_was_written() {
    let sandbox = sandbox_with_three_versions().await;

    let mut config = client_config(&sandbox.root, &sandbox.server, &sandbox.cache);
    config.use_repair = false;
    config.use_installer = false;
    let (outcome, _) = run_update(config, true);
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));

    // A crash between applying the patch and serializing the instruction
    // script leaves a fully staged cache with nothing to replay. A later run
    // must notice the root is still old and recreate the script.
    let layout = CacheLayout::new(&sandbox.cache, PRODUCT);
    fs::remove_file(layout.instructions_path()).unwrap();

    let (outcome, _) = run_update(
        client_config(&sandbox.root, &sandbox.server, &sandbox.cache),
        true,
    );
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));
    assert!(layout.instructions_path().exists());

    let executor = patchup::self_patch::SelfPatcher {
        warmup: Duration::ZERO,
        retry_interval: Duration::from_millis(1),
        ..Default::default()
    };
    executor
        .run(&layout.instructions_path(), &layout.cursor_path())
        .unwrap();
    assert_eq!(
        collect_dir_tree(&sandbox.root),
        expected_v1_2(sandbox._temp.path())
    );
    assert_eq!(
        read_version_marker(&sandbox.root, PRODUCT),
        VersionCode::parse("1.2.0")
    );
}

#[tokio::test]
async fn self_patching_stages_and_executor_completes() {
    let sandbox = sandbox_with_three_versions().await;

    let mut config = client_config(&sandbox.root, &sandbox.server, &sandbox.cache);
    config.use_repair = false;
    config.use_installer = false;
    let (outcome, _) = run_update(config, true);
    assert!(matches!(outcome, Ok(PatchOutcome::Success)));

    // The install root is untouched until the executor runs.
    assert_eq!(
        read_version_marker(&sandbox.root, PRODUCT),
        VersionCode::parse("1.0.0")
    );
    let layout = CacheLayout::new(&sandbox.cache, PRODUCT);
    assert!(layout.instructions_path().exists());

    let executor = patchup::self_patch::SelfPatcher {
        warmup: Duration::ZERO,
        retry_interval: Duration::from_millis(1),
        ..Default::default()
    };
    executor
        .run(&layout.instructions_path(), &layout.cursor_path())
        .unwrap();

    assert_eq!(
        collect_dir_tree(&sandbox.root),
        expected_v1_2(sandbox._temp.path())
    );
    assert_eq!(
        read_version_marker(&sandbox.root, PRODUCT),
        VersionCode::parse("1.2.0")
    );
    // The script's final delete removes the product cache directory.
    assert!(!layout.dir().exists());
}
