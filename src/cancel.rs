use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::PatchError;

/// Cooperative cancellation flag, checked at loop heads, directory-walk steps
/// and before blocking downloads. There is no preemption: an in-flight file
/// copy or retry sleep completes before cancellation is observed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Yield point: error out of the current operation if cancelled.
    pub fn check(&self) -> Result<(), PatchError> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}
