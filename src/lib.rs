//! Self-contained software-update engine: an rsync-style binary delta codec
//! (signature / diff / patch), a cost-based patch orchestrator with Repair,
//! Incremental and Installer strategies and cascading fallback, and a
//! crash-resumable self-patch executor driven by a durable instruction
//! script.

pub mod apply;
pub mod cache;
pub mod cancel;
pub mod container;
pub mod create;
pub mod delta;
pub mod download;
pub mod error;
pub mod events;
pub mod manifest;
pub mod patcher;
pub mod rolling_hash;
pub mod self_patch;
pub mod signature;
pub mod util;
pub mod version;

mod incremental;
mod installer;
mod repair;

pub use error::{DeltaError, PatchError};
pub use patcher::{PatchMethodKind, PatchOutcome, PatchStage, Patcher, PatcherConfig};
pub use version::VersionCode;
