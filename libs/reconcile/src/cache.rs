//! Queued snapshots with retry accounting.
//!
//! The cache remembers the last snapshot queued for each key and how many
//! consecutive convergence attempts have failed for it. It drives change
//! detection (skip snapshots equal to the queued one) and backoff pacing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Ceiling for the attempt counter, bounding backoff growth.
pub const MAX_ATTEMPTS: u32 = 60;

/// A queued snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// Last snapshot observed for the key.
    pub snapshot: T,

    /// When the snapshot was queued.
    pub enqueued_at: DateTime<Utc>,

    /// Consecutive failed attempts, at most [`MAX_ATTEMPTS`].
    pub attempts: u32,
}

/// Thread-safe map of queued snapshots.
#[derive(Debug)]
pub struct Cache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Cache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the entry for `key`.
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().get(key).cloned()
    }

    /// Queue `snapshot` for `key`, replacing any previous entry.
    ///
    /// The attempt counter starts again from zero.
    pub fn set(&self, key: &str, snapshot: T) {
        self.lock().insert(
            key.to_string(),
            CacheEntry {
                snapshot,
                enqueued_at: Utc::now(),
                attempts: 0,
            },
        );
    }

    /// Remove the entry for `key`.
    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Record a failed attempt and return the new count.
    ///
    /// Returns 0 if there is no entry for `key`.
    pub fn inc_attempts(&self, key: &str) -> u32 {
        match self.lock().get_mut(key) {
            Some(entry) => {
                entry.attempts = (entry.attempts + 1).min(MAX_ATTEMPTS);
                entry.attempts
            }
            None => 0,
        }
    }

    /// Failed attempts recorded for `key` (0 if absent).
    pub fn attempts(&self, key: &str) -> u32 {
        self.lock().get(key).map(|e| e.attempts).unwrap_or(0)
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone + PartialEq> Cache<T> {
    /// Queue `snapshot` unless it equals the one already queued.
    ///
    /// Returns true if the entry was created or replaced.
    pub fn set_if_changed(&self, key: &str, snapshot: &T) -> bool {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|e| e.snapshot == *snapshot) {
            return false;
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                enqueued_at: Utc::now(),
                attempts: 0,
            },
        );
        true
    }
}

/// Delay before retrying after `attempts` consecutive failures.
///
/// Grows linearly in `unit` and is capped at [`MAX_ATTEMPTS`] units.
pub fn backoff_delay(attempts: u32, unit: Duration) -> Duration {
    unit * attempts.min(MAX_ATTEMPTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = Cache::new();
        assert!(cache.get("w1").is_none());

        cache.set("w1", "snapshot-a".to_string());
        let entry = cache.get("w1").unwrap();
        assert_eq!(entry.snapshot, "snapshot-a");
        assert_eq!(entry.attempts, 0);

        cache.delete("w1");
        assert!(cache.get("w1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_resets_attempts() {
        let cache = Cache::new();
        cache.set("w1", 1);
        cache.inc_attempts("w1");
        cache.inc_attempts("w1");
        assert_eq!(cache.attempts("w1"), 2);

        cache.set("w1", 2);
        assert_eq!(cache.attempts("w1"), 0);
    }

    #[test]
    fn test_attempts_capped() {
        let cache = Cache::new();
        cache.set("w1", ());
        for _ in 0..100 {
            cache.inc_attempts("w1");
        }
        assert_eq!(cache.attempts("w1"), MAX_ATTEMPTS);
    }

    #[test]
    fn test_inc_attempts_missing_key() {
        let cache: Cache<()> = Cache::new();
        assert_eq!(cache.inc_attempts("missing"), 0);
        assert_eq!(cache.attempts("missing"), 0);
        assert!(!cache.contains("missing"));
    }

    #[test]
    fn test_set_if_changed_suppresses_equal_snapshots() {
        let cache = Cache::new();
        assert!(cache.set_if_changed("w1", &"a".to_string()));
        cache.inc_attempts("w1");

        assert!(!cache.set_if_changed("w1", &"a".to_string()));
        assert_eq!(cache.attempts("w1"), 1);

        assert!(cache.set_if_changed("w1", &"b".to_string()));
        assert_eq!(cache.attempts("w1"), 0);
    }

    #[test]
    fn test_backoff_delay() {
        let unit = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, unit), Duration::ZERO);
        assert_eq!(backoff_delay(1, unit), Duration::from_secs(1));
        assert_eq!(backoff_delay(7, unit), Duration::from_secs(7));
        assert_eq!(backoff_delay(600, unit), Duration::from_secs(60));
    }
}
