//! Keyed, non-blocking mutual exclusion.
//!
//! A [`Locker`] records which workloads currently have a convergence
//! operation in flight. Acquiring an already-held key fails immediately; the
//! caller is expected to skip the work rather than wait for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Held {
    /// Key to the generation of the acquisition holding it.
    keys: HashMap<String, u64>,
    next: u64,
}

/// Set of keys with an operation in flight.
///
/// Cloning a `Locker` yields another handle to the same set.
#[derive(Debug, Clone, Default)]
pub struct Locker {
    held: Arc<Mutex<Held>>,
}

impl Locker {
    /// Create an empty locker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `key`.
    ///
    /// Returns `None` if the key is already held. The returned guard releases
    /// the key when dropped.
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        let mut held = self.entries();
        if held.keys.contains_key(key) {
            return None;
        }
        held.next += 1;
        let generation = held.next;
        held.keys.insert(key.to_string(), generation);

        Some(LockGuard {
            locker: self.clone(),
            key: key.to_string(),
            generation,
        })
    }

    /// Release `key` whoever holds it. Releasing a key that is not held is a
    /// no-op.
    ///
    /// Guards from before the release do not touch later acquisitions of the
    /// same key.
    pub fn release(&self, key: &str) {
        self.entries().keys.remove(key);
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.entries().keys.contains_key(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries().keys.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.entries().keys.is_empty()
    }

    fn release_generation(&self, key: &str, generation: u64) {
        let mut held = self.entries();
        if held.keys.get(key) == Some(&generation) {
            held.keys.remove(key);
        }
    }

    // The map is only touched by O(1) operations, so a poisoned mutex still
    // holds a consistent map.
    fn entries(&self) -> MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof that a key is held. Dropping it releases the key.
#[derive(Debug)]
pub struct LockGuard {
    locker: Locker,
    key: String,
    generation: u64,
}

impl LockGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locker.release_generation(&self.key, self.generation);
    }
}
