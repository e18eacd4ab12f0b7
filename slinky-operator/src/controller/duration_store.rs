//! Per-request minimum-requeue registry.
//!
//! Any sub-step of a reconcile pass can ask for the request to be seen again
//! in at most some duration; the smallest request per key wins and is popped
//! once when the pass completes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A registry of pending requeue durations, keyed by reconcile request.
#[derive(Default)]
pub struct DurationStore {
    inner: Mutex<HashMap<String, Duration>>,
}

impl DurationStore {
    /// Request that `key` be reconciled again in at most `duration`.
    ///
    /// Zero durations are ignored; a later, smaller request tightens an
    /// earlier one.
    pub fn push(&self, key: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().expect("duration store lock poisoned");
        inner
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).min(duration))
            .or_insert(duration);
    }

    /// Remove and return the pending duration for `key`, if any.
    pub fn pop(&self, key: &str) -> Option<Duration> {
        self.inner.lock().expect("duration store lock poisoned").remove(key)
    }
}
