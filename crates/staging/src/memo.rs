//! Process-wide staging memoization with per-key single-flight

use crate::stage::StagedAsset;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Append-only map from cache key to staging result.
///
/// Guarantees at most one staging computation per distinct key per process
/// lifetime: a hit returns the stored result; a miss runs the computation
/// under a per-key gate, so concurrent callers for the same key block until
/// the first computation finishes and then all observe the same result.
/// Failed computations are never stored, so a later request can retry.
///
/// The memo is an explicit dependency of [`Stager`](crate::Stager) rather
/// than hidden global state; tests substitute an isolated instance.
#[derive(Debug, Default)]
pub struct StagingMemo {
    entries: Mutex<HashMap<String, StagedAsset>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StagingMemo {
    /// Create an empty memo.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized result for `key`, or run `compute` exactly once
    /// and store its result.
    ///
    /// # Errors
    ///
    /// Propagates the error of a failed `compute` without storing anything
    /// under `key`.
    pub fn obtain<F>(&self, key: &str, compute: F) -> Result<StagedAsset>
    where
        F: FnOnce() -> Result<StagedAsset>,
    {
        if let Some(hit) = self.lookup(key)? {
            tracing::debug!(key, "Staging memo hit");
            return Ok(hit);
        }

        let gate = {
            let mut gates = self.in_flight.lock().map_err(|_| lock_poisoned())?;
            Arc::clone(gates.entry(key.to_string()).or_default())
        };
        let _guard = gate.lock().map_err(|_| lock_poisoned())?;

        // Another caller may have finished while we waited on the gate
        if let Some(hit) = self.lookup(key)? {
            return Ok(hit);
        }

        let staged = match compute() {
            Ok(staged) => staged,
            Err(e) => {
                // Not memoized; drop the gate so a retry starts fresh
                self.drop_gate(key);
                return Err(e);
            }
        };
        self.entries
            .lock()
            .map_err(|_| lock_poisoned())?
            .insert(key.to_string(), staged.clone());
        self.drop_gate(key);
        Ok(staged)
    }

    /// Forget every memoized result. Test-isolation utility only.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of memoized results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no results are memoized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Result<Option<StagedAsset>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| lock_poisoned())?
            .get(key)
            .cloned())
    }

    fn drop_gate(&self, key: &str) {
        if let Ok(mut gates) = self.in_flight.lock() {
            gates.remove(key);
        }
    }
}

fn lock_poisoned() -> Error {
    Error::configuration("staging memo lock poisoned by a panicked computation")
}
