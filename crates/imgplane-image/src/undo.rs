//! Ordered compensating actions for multi-step protocols
//!
//! Each forward step that leaves state behind pushes the action that undoes
//! it. On failure the actions run newest first; their own failures are only
//! logged and the error that triggered the unwind is what the caller sees.

use futures::FutureExt;
use futures::future::BoxFuture;
use imgplane_common::{Error, Result};
use std::future::Future;
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub struct Compensations {
    operation: &'static str,
    steps: Vec<(&'static str, Action)>,
}

impl Compensations {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            steps: Vec::new(),
        }
    }

    /// Register the undo action for a step that just succeeded
    pub fn push<F, Fut>(&mut self, step: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((step, Box::new(move || action().boxed())));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Undo everything registered so far and hand back `original`
    pub async fn unwind(mut self, original: Error) -> Error {
        debug!(
            "{}: unwinding {} steps after: {original}",
            self.operation,
            self.steps.len()
        );
        let steps = std::mem::take(&mut self.steps);
        for (step, action) in steps.into_iter().rev() {
            match action().await {
                Ok(()) => debug!("{}: undid {step}", self.operation),
                // Already gone is the state we wanted
                Err(e) if e.is_not_found() => debug!("{}: {step} already undone", self.operation),
                Err(e) => warn!(
                    "{}: failed to undo {step}: {e} (original error: {original})",
                    self.operation
                ),
            }
        }
        original
    }

    /// Run every action newest first regardless of outcome; reports the
    /// first failure
    pub async fn run_all(mut self) -> Result<()> {
        let steps = std::mem::take(&mut self.steps);
        let mut first_err = None;
        for (step, action) in steps.into_iter().rev() {
            if let Err(e) = action().await {
                warn!("{}: {step} failed: {e}", self.operation);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Forward protocol completed; nothing to undo
    pub fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Compensations {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            warn!(
                "{}: dropped with {} pending compensations",
                self.operation,
                self.steps.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unwind_runs_newest_first_and_keeps_original() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut undo = Compensations::new("test");
        for step in ["create", "open", "register"] {
            let log = Arc::clone(&log);
            undo.push(step, move || async move {
                log.lock().push(step);
                if step == "open" {
                    Err(Error::transport("close failed"))
                } else {
                    Ok(())
                }
            });
        }
        assert_eq!(undo.len(), 3);

        let err = undo.unwind(Error::lost_race("unprotected")).await;
        assert_eq!(err, Error::lost_race("unprotected"));
        assert_eq!(*log.lock(), vec!["register", "open", "create"]);
    }

    #[tokio::test]
    async fn test_run_all_reports_first_failure() {
        let mut undo = Compensations::new("demote");
        undo.push("unblock", || async { Err(Error::busy("second")) });
        undo.push("release", || async { Err(Error::transport("first")) });
        assert_eq!(undo.run_all().await, Err(Error::transport("first")));
    }

    #[tokio::test]
    async fn test_disarm_skips_actions() {
        let ran = Arc::new(Mutex::new(false));
        let mut undo = Compensations::new("test");
        let flag = Arc::clone(&ran);
        undo.push("step", move || async move {
            *flag.lock() = true;
            Ok(())
        });
        undo.disarm();
        assert!(!*ran.lock());
    }
}
