use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use patchup::self_patch::{SelfPatchScript, SelfPatcher};
use patchup::VersionCode;

fn fast_executor() -> SelfPatcher {
    SelfPatcher {
        warmup: Duration::ZERO,
        retry_interval: Duration::from_millis(1),
        retry_attempts: 2,
    }
}

struct Setup {
    _temp: tempfile::TempDir,
    app: PathBuf,
    cache: PathBuf,
    instructions: PathBuf,
    cursor: PathBuf,
}

/// Application at 1.0.0 with a staged 1.1.0 update: one overwritten file,
/// one rename inside the root, one new file, one obsolete file, and the
/// version marker staged last.
fn staged_update() -> Setup {
    let temp = tempfile::tempdir().unwrap();
    let app = temp.path().join("app");
    let cache = temp.path().join("cache");
    let staging = cache.join("staging");
    fs::create_dir_all(&app).unwrap();
    fs::create_dir_all(&staging).unwrap();

    fs::write(app.join("main.bin"), b"main v1").unwrap();
    fs::write(app.join("old-name.txt"), b"kept content").unwrap();
    fs::write(app.join("obsolete.tmp"), b"junk").unwrap();
    fs::write(app.join("demo.version"), "1.0.0").unwrap();

    fs::write(staging.join("main.bin"), b"main v2").unwrap();
    fs::write(staging.join("extra.txt"), b"brand new").unwrap();
    fs::write(staging.join("demo.version"), "1.1.0").unwrap();

    let script = SelfPatchScript {
        installed_version: VersionCode::parse("1.0.0"),
        moves: vec![
            (app.join("old-name.txt"), app.join("new-name.txt")),
            (staging.join("main.bin"), app.join("main.bin")),
            (staging.join("extra.txt"), app.join("extra.txt")),
            (staging.join("demo.version"), app.join("demo.version")),
        ],
        deletes: vec![app.join("obsolete.tmp"), cache.clone()],
    };
    let instructions = cache.join("selfpatch.txt");
    let cursor = cache.join("selfpatch.cursor");
    script.save(&instructions).unwrap();

    Setup {
        _temp: temp,
        app,
        cache,
        instructions,
        cursor,
    }
}

fn assert_patched(app: &Path, cache: &Path) {
    assert_eq!(fs::read(app.join("main.bin")).unwrap(), b"main v2");
    assert_eq!(fs::read(app.join("new-name.txt")).unwrap(), b"kept content");
    assert_eq!(fs::read(app.join("extra.txt")).unwrap(), b"brand new");
    assert_eq!(fs::read_to_string(app.join("demo.version")).unwrap(), "1.1.0");
    assert!(!app.join("old-name.txt").exists());
    assert!(!app.join("obsolete.tmp").exists());
    // The final delete removes the cache, script included.
    assert!(!cache.exists());
}

#[test]
fn replays_a_staged_update() {
    let setup = staged_update();
    fast_executor()
        .run(&setup.instructions, &setup.cursor)
        .unwrap();
    assert_patched(&setup.app, &setup.cache);
}

#[test]
fn missing_script_is_a_no_op() {
    let temp = tempfile::tempdir().unwrap();
    fast_executor()
        .run(&temp.path().join("absent.txt"), &temp.path().join("cursor"))
        .unwrap();
}

#[test]
fn replays_partially_applied_work_without_a_cursor() {
    let setup = staged_update();
    let staging = setup.cache.join("staging");

    // A crash before the cursor was ever persisted: the first three moves
    // already happened, the marker move and the deletes did not. The full
    // replay must skip the gone sources and finish the rest.
    fs::rename(
        setup.app.join("old-name.txt"),
        setup.app.join("new-name.txt"),
    )
    .unwrap();
    fs::rename(staging.join("main.bin"), setup.app.join("main.bin")).unwrap();
    fs::rename(staging.join("extra.txt"), setup.app.join("extra.txt")).unwrap();

    fast_executor()
        .run(&setup.instructions, &setup.cursor)
        .unwrap();
    assert_patched(&setup.app, &setup.cache);
}

#[test]
fn resumes_from_the_cursor() {
    let setup = staged_update();

    // Simulate a run that crashed after instruction 0 (the rename): perform
    // it by hand, persist the cursor, and plant decoy content at the old
    // source path. A resume must skip instruction 0, leaving the decoy.
    fs::rename(
        setup.app.join("old-name.txt"),
        setup.app.join("new-name.txt"),
    )
    .unwrap();
    fs::write(setup.app.join("old-name.txt"), b"decoy").unwrap();
    fs::write(&setup.cursor, "1").unwrap();

    fast_executor()
        .run(&setup.instructions, &setup.cursor)
        .unwrap();

    assert_eq!(fs::read(setup.app.join("old-name.txt")).unwrap(), b"decoy");
    assert_eq!(
        fs::read(setup.app.join("new-name.txt")).unwrap(),
        b"kept content"
    );
    assert_eq!(fs::read(setup.app.join("main.bin")).unwrap(), b"main v2");
    assert!(!setup.cache.exists());
}

#[test]
fn stale_script_is_discarded_untouched() {
    let setup = staged_update();

    // A later update already ran: the installed marker no longer matches the
    // version this script was written against.
    fs::write(setup.app.join("demo.version"), "1.2.0").unwrap();

    fast_executor()
        .run(&setup.instructions, &setup.cursor)
        .unwrap();

    // Nothing in the root was touched and the script cleaned itself up.
    assert_eq!(fs::read(setup.app.join("main.bin")).unwrap(), b"main v1");
    assert!(setup.app.join("old-name.txt").exists());
    assert!(setup.app.join("obsolete.tmp").exists());
    assert_eq!(
        fs::read_to_string(setup.app.join("demo.version")).unwrap(),
        "1.2.0"
    );
    assert!(!setup.instructions.exists());
    assert!(!setup.cursor.exists());
}
