//! Cooperative cancellation
//!
//! One flag per service. Any thread may raise it; the worker checks it between
//! decode steps and clears it before starting each job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop signal for whichever generation is currently running
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    stop: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the running generation to stop at its next loop boundary.
    /// A no-op when nothing is running.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Clears the flag so a stop aimed at the previous job does not leak into the next.
    pub(crate) fn reset(&self) {
        self.stop.store(false, Ordering::Release);
    }
}
