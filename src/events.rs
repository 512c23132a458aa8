//! Observable events emitted by the orchestrator.
//!
//! The worker thread pushes immutable event values onto an mpsc channel; the
//! caller either drains the receiver directly or attaches an [`EventPump`]
//! that wakes on a fixed tick, coalesces progress bursts to the latest
//! snapshot, and invokes a callback. Log events are a message-kind enum with a
//! `Display` rendering, not pre-formatted strings, so front-ends can apply
//! their own formatting or translation.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::manifest::VersionInfo;
use crate::patcher::{PatchMethodKind, PatchStage};
use crate::version::VersionCode;

pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Immutable progress snapshot; replaced, never mutated in place.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub percentage: u32,
    pub label: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    Started,
    Log(LogEvent),
    Progress(ProgressSnapshot),
    OverallProgress(ProgressSnapshot),
    StageChanged(PatchStage),
    MethodChanged(PatchMethodKind),
    VersionInfoFetched(VersionInfo),
    VersionFetched {
        current: VersionCode,
        new: VersionCode,
    },
    Finished,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    CheckingForUpdates,
    RetrievingVersionInfo,
    CheckingFileIntegrity,
    AppIsUpToDate,
    UpdateAvailable {
        current: VersionCode,
        new: VersionCode,
    },
    MethodCost {
        method: PatchMethodKind,
        bytes: u64,
    },
    ApplyingMethod(PatchMethodKind),
    MethodFailed {
        method: PatchMethodKind,
        reason: String,
    },
    DownloadingFile {
        name: String,
        index: usize,
        total: usize,
        bytes: u64,
    },
    FileDownloaded {
        name: String,
        seconds: f64,
    },
    DecompressingPatch {
        name: String,
    },
    UpdatingFiles {
        count: usize,
    },
    UpdatingFile {
        name: String,
        index: usize,
        total: usize,
    },
    CreatingFile {
        name: String,
        index: usize,
        total: usize,
    },
    FileAlreadyUpToDate {
        name: String,
    },
    FilesUpdated {
        succeeded: usize,
        total: usize,
    },
    RenamingFiles {
        count: usize,
    },
    CalculatingObsoleteFiles,
    DeletingObsoleteFiles {
        count: usize,
    },
    NoObsoleteFiles,
    DeletingFile {
        path: String,
    },
    SomeFilesStillNotUpToDate,
    PatchCompleted {
        seconds: f64,
    },
    ReadyToSelfPatch,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::CheckingForUpdates => write!(f, "Checking for updates..."),
            LogEvent::RetrievingVersionInfo => write!(f, "Retrieving version info..."),
            LogEvent::CheckingFileIntegrity => write!(f, "Checking if files are up to date..."),
            LogEvent::AppIsUpToDate => write!(f, "Application is up to date"),
            LogEvent::UpdateAvailable { current, new } => {
                write!(f, "Update available: {current} -> {new}")
            }
            LogEvent::MethodCost { method, bytes } => {
                write!(f, "{method:?} patch: ~{:.1} MB to download", mb(*bytes))
            }
            LogEvent::ApplyingMethod(method) => write!(f, "Applying {method:?} patch..."),
            LogEvent::MethodFailed { method, reason } => {
                write!(f, "{method:?} patch failed: {reason}")
            }
            LogEvent::DownloadingFile {
                name,
                index,
                total,
                bytes,
            } => write!(
                f,
                "Downloading {index}/{total}: {name} ({:.1} MB)",
                mb(*bytes)
            ),
            LogEvent::FileDownloaded { name, seconds } => {
                write!(f, "{name} downloaded in {seconds:.1}s")
            }
            LogEvent::DecompressingPatch { name } => write!(f, "Decompressing {name}..."),
            LogEvent::UpdatingFiles { count } => write!(f, "Updating {count} file(s)..."),
            LogEvent::UpdatingFile { name, index, total } => {
                write!(f, "Updating {index}/{total}: {name}")
            }
            LogEvent::CreatingFile { name, index, total } => {
                write!(f, "Creating {index}/{total}: {name}")
            }
            LogEvent::FileAlreadyUpToDate { name } => write!(f, "Already up to date: {name}"),
            LogEvent::FilesUpdated { succeeded, total } => {
                write!(f, "{succeeded}/{total} file(s) updated successfully")
            }
            LogEvent::RenamingFiles { count } => write!(f, "Renaming {count} item(s)..."),
            LogEvent::CalculatingObsoleteFiles => write!(f, "Calculating obsolete files..."),
            LogEvent::DeletingObsoleteFiles { count } => {
                write!(f, "Deleting {count} obsolete file(s)...")
            }
            LogEvent::NoObsoleteFiles => write!(f, "No obsolete files"),
            LogEvent::DeletingFile { path } => write!(f, "Deleting {path}"),
            LogEvent::SomeFilesStillNotUpToDate => {
                write!(f, "Some files are still not up to date after patching")
            }
            LogEvent::PatchCompleted { seconds } => {
                write!(f, "Patch completed in {seconds:.1}s")
            }
            LogEvent::ReadyToSelfPatch => write!(f, "Ready to self patch"),
        }
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Worker-side sender. Send failures (receiver dropped) are ignored: an
/// unobserved run still completes.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<Event>) -> EventSink {
        EventSink { tx }
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn log(&self, log: LogEvent) {
        self.emit(Event::Log(log));
    }

    pub(crate) fn stage(&self, stage: PatchStage) {
        self.emit(Event::StageChanged(stage));
    }

    pub(crate) fn progress(&self, percentage: u32, label: impl Into<String>) {
        self.emit(Event::Progress(ProgressSnapshot {
            percentage,
            label: label.into(),
        }));
    }

    pub(crate) fn overall_progress(&self, percentage: u32, label: impl Into<String>) {
        self.emit(Event::OverallProgress(ProgressSnapshot {
            percentage,
            label: label.into(),
        }));
    }
}

/// Adapter thread that drains the event channel on a fixed interval and
/// invokes a callback, coalescing bursts of progress updates into at most one
/// `Progress` and one `OverallProgress` delivery per tick.
pub struct EventPump {
    rx: Receiver<Event>,
    interval: Duration,
}

impl EventPump {
    pub fn new(rx: Receiver<Event>) -> EventPump {
        EventPump {
            rx,
            interval: DEFAULT_PUMP_INTERVAL,
        }
    }

    pub fn with_interval(rx: Receiver<Event>, interval: Duration) -> EventPump {
        EventPump { rx, interval }
    }

    /// Spawn the adapter thread. It exits once the sending side disconnects
    /// and the queue has been fully drained.
    pub fn forward<F>(self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(self.interval);

            let mut progress: Option<ProgressSnapshot> = None;
            let mut overall: Option<ProgressSnapshot> = None;
            let mut disconnected = false;

            loop {
                match self.rx.try_recv() {
                    Ok(Event::Progress(snapshot)) => progress = Some(snapshot),
                    Ok(Event::OverallProgress(snapshot)) => overall = Some(snapshot),
                    Ok(event) => {
                        // Deliver pending progress before ordering-sensitive
                        // events such as Finished.
                        if let Some(snapshot) = progress.take() {
                            callback(Event::Progress(snapshot));
                        }
                        if let Some(snapshot) = overall.take() {
                            callback(Event::OverallProgress(snapshot));
                        }
                        callback(event);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }

            if let Some(snapshot) = progress {
                callback(Event::Progress(snapshot));
            }
            if let Some(snapshot) = overall {
                callback(Event::OverallProgress(snapshot));
            }
            if disconnected {
                break;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn pump_coalesces_progress_bursts() {
        let (tx, rx) = channel();
        let sink = EventSink::new(tx);

        for i in 0..100 {
            sink.progress(i, "working");
        }
        sink.emit(Event::Finished);
        drop(sink);

        let delivered = Arc::new(AtomicUsize::new(0));
        let last_pct = Arc::new(AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        let last2 = last_pct.clone();

        let pump = EventPump::with_interval(rx, Duration::from_millis(1));
        pump.forward(move |event| {
            if let Event::Progress(p) = event {
                delivered2.fetch_add(1, Ordering::SeqCst);
                last2.store(p.percentage as usize, Ordering::SeqCst);
            }
        })
        .join()
        .unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(last_pct.load(Ordering::SeqCst), 99);
    }
}
