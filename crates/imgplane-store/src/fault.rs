//! Fault injection for the in-process cluster
//!
//! Tests arm a fault for the Nth upcoming call of a named store operation
//! to drive multi-step protocols into each of their failure branches.

use imgplane_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

struct Fault {
    op: String,
    remaining: u64,
    error: Error,
}

#[derive(Default)]
pub(crate) struct FaultInjector {
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<String, u64>>,
}

impl FaultInjector {
    /// Fail the `nth` (1-based) next call of `op` with `error`
    pub fn inject(&self, op: &str, nth: u64, error: Error) {
        self.faults.lock().push(Fault {
            op: op.to_string(),
            remaining: nth.max(1),
            error,
        });
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Count the call and fire any fault that has come due
    pub fn check(&self, op: &str) -> Result<()> {
        *self.calls.lock().entry(op.to_string()).or_insert(0) += 1;

        let mut faults = self.faults.lock();
        let mut fired = None;
        for (idx, fault) in faults.iter_mut().enumerate() {
            if fault.op != op {
                continue;
            }
            fault.remaining -= 1;
            if fault.remaining == 0 && fired.is_none() {
                fired = Some(idx);
            }
        }
        match fired {
            Some(idx) => Err(faults.remove(idx).error),
            None => Ok(()),
        }
    }

    pub fn calls(&self, op: &str) -> u64 {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_on_nth_call_only() {
        let faults = FaultInjector::default();
        faults.inject("dir_add", 2, Error::Timeout);
        assert!(faults.check("dir_add").is_ok());
        assert_eq!(faults.check("dir_add"), Err(Error::Timeout));
        assert!(faults.check("dir_add").is_ok());
        assert_eq!(faults.calls("dir_add"), 3);
    }

    #[test]
    fn test_other_ops_unaffected() {
        let faults = FaultInjector::default();
        faults.inject("header_create", 1, Error::transport("injected"));
        assert!(faults.check("dir_add").is_ok());
        assert!(faults.check("header_create").is_err());
        faults.reset_calls();
        assert_eq!(faults.calls("dir_add"), 0);
    }
}
