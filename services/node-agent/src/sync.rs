//! Converges one workload: select its plan and run it.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_reconcile::{ExecuteError, Executor};
use tokio::sync::watch;
use tracing::debug;

use crate::plans::{plan_for, Services};
use crate::workload::Workload;

/// One convergence attempt for a workload.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(
        &self,
        workload: &Workload,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ExecuteError>;
}

/// Syncer backed by the workload plans.
pub struct WorkloadSyncer {
    services: Arc<Services>,
}

impl WorkloadSyncer {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Syncer for WorkloadSyncer {
    async fn sync(
        &self,
        workload: &Workload,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ExecuteError> {
        let plan = plan_for(workload, &self.services);
        debug!(
            workload_id = %workload.id,
            phase = %workload.phase,
            plan = plan.name(),
            "Syncing workload"
        );

        Executor::new(shutdown.clone()).execute(plan.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MemoryImageBackend;
    use crate::plans::testing::Fixture;
    use crate::workload::WorkloadPhase;

    #[tokio::test]
    async fn test_sync_creates_then_deletes() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        let syncer = WorkloadSyncer::new(fixture.services.clone());
        let (_tx, shutdown) = watch::channel(false);

        let mut workload = Workload::new("w1", WorkloadPhase::Pending, "runner:1", "acme");
        syncer.sync(&workload, &shutdown).await.unwrap();
        assert!(fixture.driver.is_running("w1"));
        assert_eq!(fixture.control_plane.phase("w1"), Some(WorkloadPhase::Idle));

        workload.phase = WorkloadPhase::Completed;
        syncer.sync(&workload, &shutdown).await.unwrap();
        assert!(!fixture.driver.is_running("w1"));
        assert!(fixture.vms.list_microvms().await.is_empty());
        assert_eq!(fixture.images.snapshot_count(), 0);
        assert_eq!(fixture.control_plane.deleted(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_cancelled_by_shutdown() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        let syncer = WorkloadSyncer::new(fixture.services.clone());
        let (_tx, shutdown) = watch::channel(true);

        let workload = Workload::new("w1", WorkloadPhase::Pending, "runner:1", "acme");
        let err = syncer.sync(&workload, &shutdown).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!fixture.driver.is_running("w1"));
    }
}
