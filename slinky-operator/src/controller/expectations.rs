//! In-flight create/delete expectations.
//!
//! The controller records every pod create and delete it issues and does not
//! start another reconcile pass for the same NodeSet until all of them have
//! been observed back through the event router. This keeps a stale informer
//! cache from provoking duplicate creates. Entries fail open after a bounded
//! timeout: a missed informer event must never deadlock a key forever.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long an expectations entry is trusted before `satisfied` fails open.
pub const EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Entry {
    adds: i64,
    dels: i64,
    /// UIDs of pods with a deletion in flight.
    deleting: HashSet<String>,
    /// When the expectations were last set.
    timestamp: Instant,
}

impl Entry {
    fn new() -> Self {
        Self {
            adds: 0,
            dels: 0,
            deleting: HashSet::new(),
            timestamp: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.dels <= 0 && self.deleting.is_empty()
    }

    fn expired(&self) -> bool {
        self.timestamp.elapsed() > EXPECTATIONS_TIMEOUT
    }
}

/// Per-NodeSet-key counters of pending pod creates and deletes.
#[derive(Default)]
pub struct Expectations {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Expectations {
    /// Record that `count` pod creations have been issued for `key`.
    pub fn expect_creations(&self, key: &str, count: i64) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        entry.adds += count;
        entry.timestamp = Instant::now();
    }

    /// Record that deletions of the given pod UIDs have been issued for `key`.
    pub fn expect_deletions(&self, key: &str, uids: impl IntoIterator<Item = String>) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        for uid in uids {
            if entry.deleting.insert(uid) {
                entry.dels += 1;
            }
        }
        entry.timestamp = Instant::now();
    }

    /// Observe one pod creation for `key`.
    pub fn creation_observed(&self, key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.adds -= 1;
        }
    }

    /// Observe the deletion of the pod with the given UID for `key`.
    pub fn deletion_observed(&self, key: &str, uid: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            if entry.deleting.remove(uid) {
                entry.dels -= 1;
            }
        }
    }

    /// True if a deletion of the given UID is already in flight for `key`.
    pub fn is_deletion_expected(&self, key: &str, uid: &str) -> bool {
        let entries = self.entries.lock().expect("expectations lock poisoned");
        entries.get(key).is_some_and(|entry| entry.deleting.contains(uid))
    }

    /// True when all recorded actions for `key` have been observed, or when
    /// the entry has aged past [`EXPECTATIONS_TIMEOUT`].
    pub fn satisfied(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("expectations lock poisoned");
        match entries.get(key) {
            Some(entry) => entry.fulfilled() || entry.expired(),
            None => true,
        }
    }

    /// Drop all expectations for `key`. Used when the NodeSet is gone.
    pub fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        entries.remove(key);
    }

    /// Age the entry for `key` past the fail-open timeout.
    #[cfg(test)]
    pub fn expire(&self, key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.timestamp = Instant::now() - EXPECTATIONS_TIMEOUT - Duration::from_secs(1);
        }
    }
}
