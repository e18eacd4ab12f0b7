use std::time::Duration;

use super::backoff::{FailedPodBackoff, BACKOFF_INITIAL, BACKOFF_MAX};

const KEY: &str = "default/worker-abcde";

#[test]
fn test_unknown_key_is_ready() {
    let backoff = FailedPodBackoff::default();
    assert!(backoff.ready(KEY));
    assert!(!backoff.contains(KEY));
    assert_eq!(backoff.remaining(KEY), Duration::ZERO);
}

#[test]
fn test_window_doubles_to_cap() {
    let backoff = FailedPodBackoff::default();
    assert_eq!(backoff.next(KEY), BACKOFF_INITIAL);
    assert_eq!(backoff.next(KEY), BACKOFF_INITIAL * 2);
    assert_eq!(backoff.next(KEY), BACKOFF_INITIAL * 4);
    for _ in 0..16 {
        backoff.next(KEY);
    }
    assert_eq!(backoff.next(KEY), BACKOFF_MAX);
}

#[test]
fn test_ready_after_window_elapses() {
    let backoff = FailedPodBackoff::default();
    backoff.next(KEY);
    assert!(!backoff.ready(KEY));
    assert!(backoff.remaining(KEY) <= BACKOFF_INITIAL);

    backoff.age(KEY, BACKOFF_INITIAL);
    assert!(backoff.ready(KEY));
    assert_eq!(backoff.remaining(KEY), Duration::ZERO);
}

#[test]
fn test_gc_drops_stale_entries() {
    let backoff = FailedPodBackoff::default();
    backoff.next(KEY);
    backoff.gc();
    assert!(backoff.contains(KEY), "fresh entries must survive GC");

    backoff.age(KEY, BACKOFF_MAX * 2 + Duration::from_secs(1));
    backoff.gc();
    assert!(!backoff.contains(KEY), "stale entries must be collected");
}
