use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the delta codec itself.
///
/// A [`DeltaError::Corrupt`] means the delta *stream* is malformed (bad magic,
/// unknown algorithms, copy range past the end of the basis) and re-downloading
/// the same bytes will not help. [`DeltaError::HashMismatch`] means the stream
/// decoded fine but the reconstructed file does not hash to the value recorded
/// in the delta header, so either the download or the basis is bad.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt delta: {0}")]
    Corrupt(String),

    #[error("patched file hash does not match the hash recorded in the delta")]
    HashMismatch,
}

/// Typed failure reasons surfaced by the patch orchestrator.
///
/// These are the only machine-actionable failure signal; log events carry the
/// human-readable narrative separately.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("internal fault: {0}")]
    Internal(String),

    #[error("insufficient free space on {drive}: {needed} bytes needed, {available} available")]
    InsufficientSpace {
        drive: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("write access to {path} is forbidden; retry with elevated access")]
    RequiresElevatedAccess { path: PathBuf },

    #[error("another instance of the application is already running")]
    MultipleRunningInstances,

    #[error("no suitable patch method found")]
    NoSuitablePatchMethod,

    #[error("files are still not up to date after patching")]
    FilesNotUpToDateAfterPatch,

    #[error("servers are under maintenance{}", if *can_launch { " (current version can still be launched)" } else { "" })]
    UnderMaintenance { can_launch: bool },

    #[error("download of {url} failed: {detail}")]
    Download { url: String, detail: String },

    #[error("downloaded file {name} is corrupt")]
    CorruptDownload { name: String },

    #[error("file {name} does not exist on the server")]
    FileMissingOnServer { name: String },

    #[error("file {name} is not valid on the server")]
    FileInvalidOnServer { name: String },

    #[error("manifest could not be deserialized: {0}")]
    ManifestDeserialize(String),

    #[error("manifest carries an invalid version code")]
    InvalidVersionCode,

    #[error("signature verification of {what} failed")]
    SignatureVerification { what: String },

    #[error(transparent)]
    Delta(#[from] DeltaError),
}

impl From<std::io::Error> for PatchError {
    fn from(e: std::io::Error) -> Self {
        PatchError::Internal(format!("i/o error: {e}"))
    }
}

impl From<serde_json::Error> for PatchError {
    fn from(e: serde_json::Error) -> Self {
        PatchError::ManifestDeserialize(e.to_string())
    }
}
