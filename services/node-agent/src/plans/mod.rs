//! Workload convergence plans.
//!
//! The workload phase selects the plan:
//!
//! ```text
//! Pending | Idle | Active  -> CreateWorkloadPlan
//! Completed                -> DeleteWorkloadPlan
//! ```
//!
//! Both plans probe the image backend and the VM manager and only emit the
//! steps that are still missing, so running a plan against converged state
//! does nothing.

mod create;
mod delete;
mod procedures;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::Plan;

use crate::client::ControlPlane;
use crate::guest::GuestAgent;
use crate::image::ImageBackend;
use crate::microvm::MicroVmManager;
use crate::workload::Workload;

pub use create::CreateWorkloadPlan;
pub use delete::DeleteWorkloadPlan;
pub use procedures::{Step, WorkloadProcedure};

/// Settings the procedures need beyond the workload record.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Port of the in-VM agent.
    pub guest_agent_port: u16,
    /// How long a freshly started VM has to answer pings.
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
    /// Base URL runners register against.
    pub runner_url: String,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/fleet/kernel/vmlinux"),
            guest_agent_port: 8090,
            boot_timeout: Duration::from_secs(30),
            boot_poll_interval: Duration::from_millis(500),
            runner_url: "https://github.com".to_string(),
        }
    }
}

/// Collaborators shared by every plan and procedure.
pub struct Services {
    pub control_plane: Arc<dyn ControlPlane>,
    pub images: Arc<dyn ImageBackend>,
    pub vms: Arc<MicroVmManager>,
    pub guest: Arc<dyn GuestAgent>,
    pub settings: PlanSettings,
}

/// Select the plan for the workload's current phase.
pub fn plan_for(workload: &Workload, services: &Arc<Services>) -> Box<dyn Plan> {
    let workload = Arc::new(workload.clone());
    if workload.phase.is_terminal() {
        Box::new(DeleteWorkloadPlan::new(workload, Arc::clone(services)))
    } else {
        Box::new(CreateWorkloadPlan::new(workload, Arc::clone(services)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::*;
    use crate::client::MemoryControlPlane;
    use crate::guest::MockGuestAgent;
    use crate::image::MemoryImageBackend;
    use crate::network::{AddressPool, Subnet};
    use crate::runtime::MockDriver;

    /// Fakes behind a [`Services`], kept for assertions.
    pub struct Fixture {
        pub control_plane: Arc<MemoryControlPlane>,
        pub images: Arc<MemoryImageBackend>,
        pub driver: Arc<MockDriver>,
        pub vms: Arc<MicroVmManager>,
        pub guest: Arc<MockGuestAgent>,
        pub services: Arc<Services>,
    }

    impl Fixture {
        pub fn new(images: MemoryImageBackend) -> Self {
            let control_plane = Arc::new(MemoryControlPlane::new());
            let images = Arc::new(images);
            let driver = Arc::new(MockDriver::new());
            let subnet: Subnet = "172.20.0.0/24".parse().unwrap();
            let vms = Arc::new(MicroVmManager::new(
                driver.clone(),
                Arc::new(AddressPool::new(subnet)),
            ));
            let guest = Arc::new(MockGuestAgent::new());
            let services = Arc::new(Services {
                control_plane: control_plane.clone(),
                images: images.clone(),
                vms: vms.clone(),
                guest: guest.clone(),
                settings: PlanSettings {
                    boot_timeout: Duration::from_millis(200),
                    boot_poll_interval: Duration::from_millis(10),
                    ..PlanSettings::default()
                },
            });

            Self {
                control_plane,
                images,
                driver,
                vms,
                guest,
                services,
            }
        }
    }

    /// Names of the procedures a plan builds.
    pub async fn step_names(plan: &dyn Plan) -> Vec<String> {
        plan.create()
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}
