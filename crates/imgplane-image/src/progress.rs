//! Progress reporting for long-running image operations

use parking_lot::Mutex;
use tracing::debug;

/// Receives cumulative progress of copy, flatten, trim and rollback
pub trait ProgressContext: Send + Sync {
    fn update_progress(&self, done: u64, total: u64);
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgress;

impl ProgressContext for NoOpProgress {
    fn update_progress(&self, _done: u64, _total: u64) {}
}

/// Logs progress at debug level
#[derive(Debug, Clone)]
pub struct LogProgress {
    operation: &'static str,
}

impl LogProgress {
    #[must_use]
    pub const fn new(operation: &'static str) -> Self {
        Self { operation }
    }
}

impl ProgressContext for LogProgress {
    fn update_progress(&self, done: u64, total: u64) {
        debug!("{}: {done}/{total}", self.operation);
    }
}

/// Keeps every update, for callers that inspect progress afterwards
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<(u64, u64)>>,
}

impl RecordingProgress {
    #[must_use]
    pub fn updates(&self) -> Vec<(u64, u64)> {
        self.updates.lock().clone()
    }

    /// Most recent `(done, total)` pair
    #[must_use]
    pub fn last(&self) -> Option<(u64, u64)> {
        self.updates.lock().last().copied()
    }
}

impl ProgressContext for RecordingProgress {
    fn update_progress(&self, done: u64, total: u64) {
        self.updates.lock().push((done, total));
    }
}
