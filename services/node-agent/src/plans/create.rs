use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use fleet_reconcile::{Plan, Procedure};

use super::procedures::{Step, WorkloadProcedure};
use super::Services;
use crate::workload::{PullPolicy, Workload, WorkloadPhase};

/// Brings a workload's VM up and its runner registered.
pub struct CreateWorkloadPlan {
    workload: Arc<Workload>,
    services: Arc<Services>,
}

impl CreateWorkloadPlan {
    pub fn new(workload: Arc<Workload>, services: Arc<Services>) -> Self {
        Self { workload, services }
    }

    /// Steps still needed, in execution order.
    pub async fn steps(&self) -> Result<Vec<Step>> {
        let w = &self.workload;
        let images = &self.services.images;
        let mut steps = Vec::new();

        match w.image_pull_policy {
            PullPolicy::Always => steps.push(Step::PullImage),
            PullPolicy::IfNotPresent => {
                if !images.image_exists(&w.image).await? {
                    steps.push(Step::PullImage);
                }
            }
            PullPolicy::Never => {
                if !images.image_exists(&w.image).await? {
                    bail!(
                        "image {} is not present locally and pull policy is Never",
                        w.image
                    );
                }
            }
        }

        if !images.snapshot_exists(&w.id).await? {
            steps.push(Step::CreateSnapshot);
        }

        match self.services.vms.get_microvm(&w.id).await {
            Ok(vm) if vm.is_running() => {}
            Ok(_) => steps.extend([Step::StartMicroVm, Step::StartRunner]),
            Err(e) if e.is_not_found() => {
                steps.extend([Step::CreateMicroVm, Step::StartMicroVm, Step::StartRunner])
            }
            Err(e) => return Err(e.into()),
        }

        if w.phase == WorkloadPhase::Pending {
            steps.push(Step::SetPhase(WorkloadPhase::Idle));
        }

        Ok(steps)
    }
}

#[async_trait]
impl Plan for CreateWorkloadPlan {
    fn name(&self) -> &str {
        "create-workload"
    }

    async fn create(&self) -> Result<Vec<Box<dyn Procedure>>> {
        let steps = self.steps().await?;
        Ok(WorkloadProcedure::boxed(steps, &self.workload, &self.services))
    }
}
