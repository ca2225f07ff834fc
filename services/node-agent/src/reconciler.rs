//! Reconciliation loop for converging workloads on this node.
//!
//! The reconciler:
//! - Periodically lists the node's workloads from the control plane
//! - Queues the ones that are new or changed since they were last queued
//! - Runs a fixed pool of workers that converge one workload at a time each
//! - Re-queues failed workloads after a linear backoff
//!
//! Per workload the flow is:
//!
//! ```text
//! unqueued -> queued -> in flight -> unqueued              (success)
//!                                 -> queued after delay    (failure)
//! ```
//!
//! At most one convergence attempt per workload is in flight; a worker that
//! dequeues a workload whose lock is held drops that occurrence.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{backoff_delay, Cache, ExecuteError, Locker};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ControlPlane};
use crate::sync::Syncer;
use crate::workload::Workload;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between workload listings.
    pub interval: Duration,

    /// Number of workers converging workloads.
    pub workers: usize,

    /// Capacity of the work queue.
    pub queue_capacity: usize,

    /// Deadline for one convergence attempt.
    pub sync_timeout: Duration,

    /// Backoff unit; a workload that failed `n` times waits `n` units.
    pub retry_unit: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: fleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
            workers: 4,
            queue_capacity: 1024,
            sync_timeout: fleet_reconcile::DEFAULT_SYNC_TIMEOUT,
            retry_unit: fleet_reconcile::DEFAULT_RETRY_UNIT,
        }
    }
}

/// Error from one convergence attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cancelled by shutdown")]
    Cancelled,

    #[error("sync did not finish within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

impl SyncError {
    /// Cancellation-class errors are never retried.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Execute(e) => e.is_cancelled(),
            Self::Timeout(_) => false,
        }
    }
}

/// What a worker did with a dequeued workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Converged; the cache entry was removed.
    Synced,
    /// Another attempt was in flight; this occurrence was dropped.
    Locked,
    /// No cache entry; already handled.
    Missing,
    /// Stopped by shutdown; not rescheduled.
    Cancelled,
    /// Failed; re-queued after `retry_in`.
    Failed { attempts: u32, retry_in: Duration },
}

/// Point-in-time copy of the reconciler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub ticks: u64,
    pub enqueued: u64,
    pub synced: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    enqueued: AtomicU64,
    synced: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Reconciler for converging workloads.
pub struct Reconciler {
    config: ReconcilerConfig,
    control_plane: Arc<dyn ControlPlane>,
    syncer: Arc<dyn Syncer>,
    cache: Cache<Workload>,
    locker: Locker,
    counters: Counters,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        control_plane: Arc<dyn ControlPlane>,
        syncer: Arc<dyn Syncer>,
    ) -> Self {
        Self {
            config,
            control_plane,
            syncer,
            cache: Cache::new(),
            locker: Locker::new(),
            counters: Counters::default(),
        }
    }

    /// Queued workloads.
    pub fn cache(&self) -> &Cache<Workload> {
        &self.cache
    }

    /// Workloads with an attempt in flight.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn stats(&self) -> ReconcilerStats {
        let c = &self.counters;
        ReconcilerStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            synced: c.synced.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Run the lister and the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting reconciliation loop"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|n| {
                tokio::spawn(Arc::clone(&self).worker(
                    n,
                    Arc::clone(&rx),
                    tx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        self.list_loop(tx, shutdown).await;

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        info!(stats = ?self.stats(), "Reconciler stopped");
    }

    async fn list_loop(&self, tx: mpsc::Sender<String>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile(&tx).await {
                        warn!(error = %e, "Failed to list workloads, will retry");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Lister stopped");
    }

    /// Perform a single listing pass and queue new or changed workloads.
    ///
    /// Returns the number of workloads queued.
    pub async fn reconcile(&self, tx: &mpsc::Sender<String>) -> Result<usize, ClientError> {
        bump(&self.counters.ticks);

        let workloads = self.control_plane.list_workloads().await?;
        let listed = workloads.len();
        let mut enqueued = 0;

        for workload in workloads {
            if !self.cache.set_if_changed(&workload.id, &workload) {
                continue;
            }

            match tx.try_send(workload.id.clone()) {
                Ok(()) => {
                    bump(&self.counters.enqueued);
                    enqueued += 1;
                    debug!(workload_id = %workload.id, phase = %workload.phase, "Queued workload");
                }
                Err(TrySendError::Full(id)) => {
                    // Forget it so the next tick sees it as new.
                    self.cache.delete(&id);
                    error!(
                        workload_id = %id,
                        capacity = self.config.queue_capacity,
                        "Work queue full, dropping workload until next tick"
                    );
                }
                Err(TrySendError::Closed(id)) => {
                    self.cache.delete(&id);
                    debug!("Work queue closed, stopping listing pass");
                    break;
                }
            }
        }

        debug!(listed, enqueued, "Reconciliation pass complete");
        Ok(enqueued)
    }

    async fn worker(
        self: Arc<Self>,
        n: usize,
        rx: Arc<Mutex<mpsc::Receiver<String>>>,
        tx: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker = n, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let id = tokio::select! {
                id = async { rx.lock().await.recv().await } => match id {
                    Some(id) => id,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            self.process(&id, &tx, &shutdown).await;
        }

        debug!(worker = n, "Worker stopped");
    }

    /// Converge one dequeued workload.
    pub async fn process(
        &self,
        id: &str,
        tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
    ) -> SyncOutcome {
        let Some(_guard) = self.locker.try_acquire(id) else {
            bump(&self.counters.skipped);
            debug!(workload_id = %id, "Sync already in flight, skipping");
            return SyncOutcome::Locked;
        };

        let Some(entry) = self.cache.get(id) else {
            debug!(workload_id = %id, "Workload no longer queued, skipping");
            return SyncOutcome::Missing;
        };

        match self.sync_once(&entry.snapshot, shutdown).await {
            Ok(()) => {
                self.cache.delete(id);
                bump(&self.counters.synced);
                info!(workload_id = %id, phase = %entry.snapshot.phase, "Workload synced");
                SyncOutcome::Synced
            }
            Err(e) if e.is_cancelled() => {
                bump(&self.counters.cancelled);
                debug!(workload_id = %id, "Sync cancelled");
                SyncOutcome::Cancelled
            }
            Err(e) => {
                bump(&self.counters.failed);
                let attempts = self.cache.inc_attempts(id);
                let retry_in = backoff_delay(attempts, self.config.retry_unit);

                warn!(
                    workload_id = %id,
                    attempts,
                    retry_in_secs = retry_in.as_secs(),
                    error = %error_chain(&e),
                    "Sync failed"
                );

                if attempts > 0 {
                    self.schedule_retry(id, retry_in, tx, shutdown);
                }
                SyncOutcome::Failed { attempts, retry_in }
            }
        }
    }

    /// Run the syncer under the attempt deadline, stopping early on shutdown.
    async fn sync_once(
        &self,
        workload: &Workload,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let timeout = self.config.sync_timeout;
        let mut signal = shutdown.clone();

        tokio::select! {
            result = tokio::time::timeout(timeout, self.syncer.sync(workload, shutdown)) => {
                match result {
                    Ok(result) => result.map_err(SyncError::from),
                    Err(_) => Err(SyncError::Timeout(timeout)),
                }
            }
            _ = shutdown_signalled(&mut signal) => Err(SyncError::Cancelled),
        }
    }

    /// Re-queue `id` after `delay` unless shutdown comes first.
    fn schedule_retry(
        &self,
        id: &str,
        delay: Duration,
        tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let id = id.to_string();
        let tx = tx.clone();
        let mut shutdown = shutdown.clone();

        tokio::spawn(async move {
            let requeue = async {
                tokio::time::sleep(delay).await;
                tx.send(id.clone()).await
            };

            tokio::select! {
                result = requeue => {
                    if result.is_err() {
                        debug!(workload_id = %id, "Work queue closed, retry dropped");
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {}
            }
        });
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// `outer: cause: root cause`
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    std::iter::successors(Some(err), |&e| e.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
