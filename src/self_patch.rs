//! Self-patch instruction script and its crash-resumable executor.
//!
//! The orchestrator stages files it cannot overwrite while the application is
//! running, then writes a flat instruction script to the cache. A separate
//! small executable replays the script after the application exits. The
//! executor persists a cursor before each instruction so an interrupted run
//! resumes where it left off, and every instruction is idempotent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::VERSION_MARKER_EXTENSION;
use crate::error::PatchError;
use crate::util::drive_root;
use crate::version::VersionCode;

/// Token separator in the instruction script. Paths may not contain it.
pub const SEPARATOR: &str = "><";
pub const MOVE_OP: &str = "_#MOVE#_";
pub const DELETE_OP: &str = "_#DELETE#_";

/// Time the executor waits before touching any files, so the application that
/// launched it has finished exiting and released its file locks.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 8;

/// Ordered instructions for one self-patch: moves first (staged files into
/// the application root, the version marker last among them), then deletes
/// (obsolete files, with the cache directory as the final entry so the script
/// removes itself on completion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfPatchScript {
    pub installed_version: VersionCode,
    pub moves: Vec<(PathBuf, PathBuf)>,
    pub deletes: Vec<PathBuf>,
}

impl SelfPatchScript {
    pub fn instruction_count(&self) -> usize {
        self.moves.len() + self.deletes.len()
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.installed_version.to_string());
        out.push_str(SEPARATOR);
        out.push_str(MOVE_OP);
        out.push_str(SEPARATOR);
        for (from, to) in &self.moves {
            out.push_str(&from.to_string_lossy());
            out.push_str(SEPARATOR);
            out.push_str(&to.to_string_lossy());
            out.push_str(SEPARATOR);
        }
        out.push_str(DELETE_OP);
        out.push_str(SEPARATOR);
        for path in &self.deletes {
            out.push_str(&path.to_string_lossy());
            out.push_str(SEPARATOR);
        }
        out
    }

    pub fn parse(text: &str) -> Result<SelfPatchScript, PatchError> {
        let corrupt = |detail: &str| PatchError::Internal(format!("corrupt self-patch script: {detail}"));

        let mut tokens = text.split(SEPARATOR);
        let version = VersionCode::parse(tokens.next().ok_or_else(|| corrupt("empty"))?);
        if !version.is_valid() {
            return Err(corrupt("missing version"));
        }
        if tokens.next() != Some(MOVE_OP) {
            return Err(corrupt("missing move marker"));
        }

        let mut moves = Vec::new();
        let mut deletes = Vec::new();
        loop {
            let token = tokens.next().ok_or_else(|| corrupt("unterminated move list"))?;
            if token == DELETE_OP {
                break;
            }
            let to = tokens.next().ok_or_else(|| corrupt("move without destination"))?;
            moves.push((PathBuf::from(token), PathBuf::from(to)));
        }
        for token in tokens {
            if !token.is_empty() {
                deletes.push(PathBuf::from(token));
            }
        }

        Ok(SelfPatchScript {
            installed_version: version,
            moves,
            deletes,
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }
}

enum Instruction<'a> {
    Move { from: &'a Path, to: &'a Path },
    Delete(&'a Path),
}

/// Replays a [`SelfPatchScript`] from disk. All timings are configurable so
/// tests can run without the production warmup.
pub struct SelfPatcher {
    pub warmup: Duration,
    pub retry_interval: Duration,
    pub retry_attempts: u32,
}

impl Default for SelfPatcher {
    fn default() -> SelfPatcher {
        SelfPatcher {
            warmup: DEFAULT_WARMUP,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

impl SelfPatcher {
    pub fn run(&self, instructions_path: &Path, cursor_path: &Path) -> Result<(), PatchError> {
        let text = match fs::read_to_string(instructions_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no pending self-patch");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let script = SelfPatchScript::parse(&text)?;

        std::thread::sleep(self.warmup);

        if self.is_stale(&script) {
            tracing::info!(
                version = %script.installed_version,
                "a different version is already installed; skipping stale script"
            );
            let _ = fs::remove_file(cursor_path);
            let _ = fs::remove_file(instructions_path);
            return Ok(());
        }

        let instructions: Vec<Instruction<'_>> = script
            .moves
            .iter()
            .map(|(from, to)| Instruction::Move { from, to })
            .chain(script.deletes.iter().map(|p| Instruction::Delete(p)))
            .collect();

        let completed = read_cursor(cursor_path).min(instructions.len());
        if completed > 0 {
            tracing::info!(completed, "resuming interrupted self-patch");
        }

        for (index, instruction) in instructions.iter().enumerate().skip(completed) {
            // Persist progress before the instruction runs: on crash the
            // current instruction re-executes, which is safe because every
            // instruction is idempotent.
            write_cursor(cursor_path, index)?;
            match instruction {
                Instruction::Move { from, to } => {
                    tracing::debug!(from = %from.display(), to = %to.display(), "move");
                    self.move_item(from, to)?;
                }
                Instruction::Delete(path) => {
                    tracing::debug!(path = %path.display(), "delete");
                    self.delete_item(path)?;
                }
            }
        }

        // Normally the final delete removes the cache directory holding both
        // of these files; clean up if the script did not.
        let _ = fs::remove_file(cursor_path);
        let _ = fs::remove_file(instructions_path);
        tracing::info!(version = %script.installed_version, "self-patch completed");
        Ok(())
    }

    /// A script is stale when the version marker it would install already
    /// exists at its destination with a different version: a later patch has
    /// run since this script was written, and replaying it would clobber
    /// newer files.
    fn is_stale(&self, script: &SelfPatchScript) -> bool {
        for (_, to) in &script.moves {
            let is_marker = to
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(VERSION_MARKER_EXTENSION));
            if !is_marker {
                continue;
            }
            if let Ok(text) = fs::read_to_string(to) {
                let installed = VersionCode::parse(text.trim());
                if installed.is_valid() && installed != script.installed_version {
                    return true;
                }
            }
            return false;
        }
        false
    }

    fn move_item(&self, from: &Path, to: &Path) -> Result<(), PatchError> {
        let meta = match fs::symlink_metadata(from) {
            Ok(meta) => meta,
            // Already moved by a previous, interrupted run.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            self.move_dir(from, to)
        } else {
            self.move_file(from, to)
        }
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), PatchError> {
        if to.exists() {
            // The destination may still be locked by a process that has not
            // fully exited; overwrite in place with bounded retries.
            self.retry_io(|| {
                fs::copy(from, to)?;
                Ok(())
            })?;
            fs::remove_file(from)?;
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Cross-device move.
                fs::copy(from, to)?;
                fs::remove_file(from)?;
                Ok(())
            }
        }
    }

    fn move_dir(&self, from: &Path, to: &Path) -> Result<(), PatchError> {
        if to.exists() {
            // Merge into the existing tree.
            for entry in fs::read_dir(from)? {
                let entry = entry?;
                self.move_item(&entry.path(), &to.join(entry.file_name()))?;
            }
            let _ = fs::remove_dir(from);
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if drive_root(from) == drive_root(to) {
            if fs::rename(from, to).is_ok() {
                return Ok(());
            }
        }
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            self.move_item(&entry.path(), &to.join(entry.file_name()))?;
        }
        let _ = fs::remove_dir(from);
        Ok(())
    }

    fn delete_item(&self, path: &Path) -> Result<(), PatchError> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            self.retry_io(|| fs::remove_dir_all(path))?;
            // remove_dir_all can return before the directory entry is gone on
            // some platforms; poll briefly so a following recreate succeeds.
            for _ in 0..self.retry_attempts {
                if !path.exists() {
                    break;
                }
                std::thread::sleep(self.retry_interval);
            }
        } else {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn retry_io(&self, mut op: impl FnMut() -> io::Result<()>) -> Result<(), PatchError> {
        let attempts = self.retry_attempts.max(1);
        for attempt in 0..attempts {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 == attempts => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "io retry");
                    std::thread::sleep(self.retry_interval);
                }
            }
        }
        Ok(())
    }
}

/// Spawns the self-patch executor process against a pending script and does
/// not wait for it; the caller is expected to exit so its files unlock.
pub fn spawn_executor(
    executor: &Path,
    instructions: &Path,
    cursor: &Path,
    post_run: Option<&Path>,
) -> Result<(), PatchError> {
    let mut command = std::process::Command::new(executor);
    command.arg(instructions).arg(cursor);
    if let Some(exe) = post_run {
        command.arg("--launch").arg(exe);
    }
    command
        .spawn()
        .map_err(|e| PatchError::Internal(format!("launching {}: {e}", executor.display())))?;
    Ok(())
}

/// Launches the application after a self-patch, with the executable's own
/// directory as working directory, and does not wait for it.
pub fn launch_post_patch(executable: &Path) -> Result<(), PatchError> {
    let mut command = std::process::Command::new(executable);
    if let Some(dir) = executable.parent() {
        command.current_dir(dir);
    }
    command
        .spawn()
        .map_err(|e| PatchError::Internal(format!("launching {}: {e}", executable.display())))?;
    Ok(())
}

fn read_cursor(path: &Path) -> usize {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

fn write_cursor(path: &Path, completed: usize) -> io::Result<()> {
    fs::write(path, completed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_script() -> SelfPatchScript {
        SelfPatchScript {
            installed_version: VersionCode::parse("2.0"),
            moves: vec![
                (PathBuf::from("/cache/staging/a.bin"), PathBuf::from("/app/a.bin")),
                (PathBuf::from("/cache/staging/app.version"), PathBuf::from("/app/app.version")),
            ],
            deletes: vec![PathBuf::from("/app/old.bin"), PathBuf::from("/cache")],
        }
    }

    #[test]
    fn script_round_trip() {
        let script = sample_script();
        let parsed = SelfPatchScript::parse(&script.serialize()).unwrap();
        assert_eq!(parsed, script);
        assert_eq!(parsed.instruction_count(), 4);
    }

    #[test]
    fn script_without_deletes_round_trips() {
        let script = SelfPatchScript {
            installed_version: VersionCode::parse("1.0"),
            moves: vec![(PathBuf::from("/x"), PathBuf::from("/y"))],
            deletes: vec![],
        };
        assert_eq!(SelfPatchScript::parse(&script.serialize()).unwrap(), script);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SelfPatchScript::parse("").is_err());
        assert!(SelfPatchScript::parse("not a script").is_err());
        assert!(SelfPatchScript::parse("1.0><_#MOVE#_><only-from><").is_err());
    }

    #[test]
    fn cursor_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = dir.path().join("cursor");
        assert_eq!(read_cursor(&cursor), 0);
        fs::write(&cursor, "garbage").unwrap();
        assert_eq!(read_cursor(&cursor), 0);
        write_cursor(&cursor, 3).unwrap();
        assert_eq!(read_cursor(&cursor), 3);
    }
}
