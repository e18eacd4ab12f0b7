//! Exponential backoff for failed pods.
//!
//! A pod which keeps failing or never leaves `Pending` is deleted and
//! recreated, but each replacement doubles the wait before the next attempt
//! (1s initial, capped at 15m). Stale entries are garbage-collected by a
//! background task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Initial retry delay for a failed pod.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Retry delay ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
struct Entry {
    backoff: Duration,
    last_update: Instant,
}

/// Per-pod-key exponential backoff.
#[derive(Default)]
pub struct FailedPodBackoff {
    entries: Mutex<HashMap<String, Entry>>,
}

impl FailedPodBackoff {
    /// True when the backoff window for `key` has elapsed and the next
    /// attempt may proceed.
    pub fn ready(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("backoff lock poisoned");
        match entries.get(key) {
            Some(entry) => entry.last_update.elapsed() >= entry.backoff,
            None => true,
        }
    }

    /// Time remaining until the next attempt for `key` may proceed.
    pub fn remaining(&self, key: &str) -> Duration {
        let entries = self.entries.lock().expect("backoff lock poisoned");
        match entries.get(key) {
            Some(entry) => entry.backoff.saturating_sub(entry.last_update.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record another attempt for `key`, doubling its window up to the cap,
    /// and return the new window.
    pub fn next(&self, key: &str) -> Duration {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            backoff: Duration::ZERO,
            last_update: Instant::now(),
        });
        entry.backoff = if entry.backoff.is_zero() {
            BACKOFF_INITIAL
        } else {
            (entry.backoff * 2).min(BACKOFF_MAX)
        };
        entry.last_update = Instant::now();
        entry.backoff
    }

    /// True if a backoff window has ever been recorded for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("backoff lock poisoned").contains_key(key)
    }

    /// Drop entries idle for longer than twice the backoff ceiling.
    pub fn gc(&self) {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        entries.retain(|_, entry| entry.last_update.elapsed() < BACKOFF_MAX * 2);
    }

    #[cfg(test)]
    pub fn age(&self, key: &str, by: Duration) {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.last_update -= by;
        }
    }
}
