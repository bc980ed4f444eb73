//! Per-owner exponential backoff for transient external-resource failures.
//!
//! Keys are owner UIDs; idle entries are garbage collected on reconcile
//! exit so the table does not grow with deleted owners.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

const DEFAULT_BASE: Duration = Duration::from_secs(10);
const DEFAULT_CAP: Duration = Duration::from_secs(300);
const DEFAULT_IDLE: Duration = Duration::from_secs(600);

struct Entry {
    failures: u32,
    last_touched: Instant,
}

/// Keyed exponential backoff: base * 2^(failures-1), capped.
pub struct OwnerBackoff {
    base: Duration,
    cap: Duration,
    max_idle: Duration,
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl Default for OwnerBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP, DEFAULT_IDLE)
    }
}

impl OwnerBackoff {
    pub fn new(base: Duration, cap: Duration, max_idle: Duration) -> Self {
        Self { base, cap, max_idle, entries: Mutex::new(FxHashMap::default()) }
    }

    /// Record a failure for `key` and return the delay before the next try.
    pub fn next(&self, key: &str) -> Duration {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.failures = e.failures.saturating_add(1);
                e.last_touched = Instant::now();
            })
            .or_insert_with(|| Entry { failures: 1, last_touched: Instant::now() });
        let exp = entry.failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    /// Current delay for `key` without recording a failure.
    pub fn get(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().expect("backoff lock poisoned");
        entries.get(key).map(|e| {
            let exp = e.failures.saturating_sub(1).min(31);
            self.base.saturating_mul(1u32 << exp).min(self.cap)
        })
    }

    /// Drop the entry after a success.
    pub fn forget(&self, key: &str) {
        self.entries.lock().expect("backoff lock poisoned").remove(key);
    }

    /// Remove entries untouched for longer than `max_idle`. Called on
    /// reconcile exit.
    pub fn gc(&self) {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        entries.retain(|_, e| e.last_touched.elapsed() < self.max_idle);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("backoff lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let b = OwnerBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(600),
        );
        assert_eq!(b.next("u1"), Duration::from_secs(1));
        assert_eq!(b.next("u1"), Duration::from_secs(2));
        assert_eq!(b.next("u1"), Duration::from_secs(4));
        assert_eq!(b.next("u1"), Duration::from_secs(4));
        // independent key starts fresh
        assert_eq!(b.next("u2"), Duration::from_secs(1));
    }

    #[test]
    fn forget_resets() {
        let b = OwnerBackoff::default();
        b.next("u1");
        b.next("u1");
        b.forget("u1");
        assert_eq!(b.get("u1"), None);
        assert_eq!(b.next("u1"), Duration::from_secs(10));
    }

    #[test]
    fn gc_drops_idle_entries() {
        let b = OwnerBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::ZERO,
        );
        b.next("u1");
        b.gc();
        assert!(b.is_empty());
    }
}
