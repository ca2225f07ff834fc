use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fleet_reconcile::{Plan, Procedure};

use super::procedures::{Step, WorkloadProcedure};
use super::Services;
use crate::workload::Workload;

/// Tears down a completed workload and removes its record.
pub struct DeleteWorkloadPlan {
    workload: Arc<Workload>,
    services: Arc<Services>,
}

impl DeleteWorkloadPlan {
    pub fn new(workload: Arc<Workload>, services: Arc<Services>) -> Self {
        Self { workload, services }
    }

    /// Steps still needed, in execution order. Always ends with the record
    /// deletion.
    pub async fn steps(&self) -> Result<Vec<Step>> {
        let id = &self.workload.id;
        let mut steps = Vec::new();

        match self.services.vms.get_microvm(id).await {
            Ok(vm) => {
                if vm.is_running() {
                    steps.extend([Step::StopRunner, Step::StopMicroVm]);
                }
                steps.push(Step::DeleteMicroVm);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if self.services.images.snapshot_exists(id).await? {
            steps.push(Step::DeleteSnapshot);
        }

        steps.push(Step::DeleteWorkload);
        Ok(steps)
    }
}

#[async_trait]
impl Plan for DeleteWorkloadPlan {
    fn name(&self) -> &str {
        "delete-workload"
    }

    async fn create(&self) -> Result<Vec<Box<dyn Procedure>>> {
        let steps = self.steps().await?;
        Ok(WorkloadProcedure::boxed(steps, &self.workload, &self.services))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{step_names, Fixture};
    use super::*;
    use crate::image::MemoryImageBackend;
    use crate::microvm::VmSpec;
    use crate::workload::WorkloadPhase;

    fn plan(fixture: &Fixture) -> DeleteWorkloadPlan {
        let workload = Workload::new("w2", WorkloadPhase::Completed, "runner:1", "acme");
        DeleteWorkloadPlan::new(Arc::new(workload), fixture.services.clone())
    }

    fn spec() -> VmSpec {
        VmSpec {
            id: "w2".to_string(),
            vcpus: 1,
            memory_bytes: 512 * 1024 * 1024,
            kernel_path: "/vmlinux".into(),
            boot_args: None,
            drives: vec![],
            network_interfaces: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_nothing_left_but_the_record() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        assert_eq!(step_names(&plan(&fixture)).await, vec!["delete_workload"]);
    }

    #[tokio::test]
    async fn test_stopped_vm_is_deleted_without_runner_stop() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        fixture.vms.create_microvm(spec()).await.unwrap();

        assert_eq!(
            step_names(&plan(&fixture)).await,
            vec!["delete_microvm", "delete_workload"]
        );
    }

    #[tokio::test]
    async fn test_running_vm_with_snapshot() {
        let fixture =
            Fixture::new(MemoryImageBackend::new().with_snapshot("w2", "runner:1"));
        fixture.vms.create_microvm(spec()).await.unwrap();
        fixture.vms.start_microvm("w2").await.unwrap();

        assert_eq!(
            step_names(&plan(&fixture)).await,
            vec![
                "stop_runner",
                "stop_microvm",
                "delete_microvm",
                "delete_snapshot",
                "delete_workload"
            ]
        );
    }
}
