//! Reconciliation loop primitives.
//!
//! This library provides the building blocks for loops that converge actual
//! state toward a desired state declared elsewhere:
//!
//! - [`Locker`]: at most one convergence operation in flight per key.
//! - [`Cache`]: the last queued snapshot per key plus its failed-attempt
//!   counter, used for change detection and backoff pacing.
//! - [`Plan`], [`Procedure`] and [`Executor`]: a freshly built, ordered list
//!   of idempotent steps run until the first failure.
//!
//! # Invariants
//!
//! - Procedures are idempotent; a failed plan is rebuilt and rerun, never
//!   rolled back.
//! - Attempt counters never exceed [`MAX_ATTEMPTS`].
//! - A held lock is released on every exit path.

mod cache;
mod lock;
mod plan;

use std::time::Duration;

pub use cache::{backoff_delay, Cache, CacheEntry, MAX_ATTEMPTS};
pub use lock::{LockGuard, Locker};
pub use plan::{ExecuteError, Executor, Plan, Procedure};

/// Default interval between listings of desired state.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline for a single convergence attempt.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default backoff unit; the retry delay is `attempts` of these.
pub const DEFAULT_RETRY_UNIT: Duration = Duration::from_secs(1);
