//! Concrete workload procedures.
//!
//! Every step is safe to re-run after a partial failure: creation steps are
//! create-if-missing, deletion steps treat "already gone" as success.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fleet_reconcile::Procedure;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Services;
use crate::guest::{StartRunnerRequest, StopRunnerRequest};
use crate::microvm::{DriveSpec, NetworkSpec, VmSpec};
use crate::network::{generate_mac_address, tap_name};
use crate::workload::{Workload, WorkloadPhase};

/// One convergence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PullImage,
    CreateSnapshot,
    CreateMicroVm,
    StartMicroVm,
    StartRunner,
    SetPhase(WorkloadPhase),
    StopRunner,
    StopMicroVm,
    DeleteMicroVm,
    DeleteSnapshot,
    DeleteWorkload,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PullImage => "pull_image",
            Self::CreateSnapshot => "create_snapshot",
            Self::CreateMicroVm => "create_microvm",
            Self::StartMicroVm => "start_microvm",
            Self::StartRunner => "start_runner",
            Self::SetPhase(_) => "set_workload_phase",
            Self::StopRunner => "stop_runner",
            Self::StopMicroVm => "stop_microvm",
            Self::DeleteMicroVm => "delete_microvm",
            Self::DeleteSnapshot => "delete_snapshot",
            Self::DeleteWorkload => "delete_workload",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetPhase(phase) => write!(f, "{}={}", self.name(), phase),
            _ => f.write_str(self.name()),
        }
    }
}

/// A [`Step`] bound to a workload and the services it acts on.
pub struct WorkloadProcedure {
    step: Step,
    workload: Arc<Workload>,
    services: Arc<Services>,
}

impl WorkloadProcedure {
    pub fn new(step: Step, workload: Arc<Workload>, services: Arc<Services>) -> Self {
        Self {
            step,
            workload,
            services,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Bind each step to the same workload and services.
    pub fn boxed(
        steps: impl IntoIterator<Item = Step>,
        workload: &Arc<Workload>,
        services: &Arc<Services>,
    ) -> Vec<Box<dyn Procedure>> {
        steps
            .into_iter()
            .map(|step| {
                Box::new(Self::new(step, Arc::clone(workload), Arc::clone(services)))
                    as Box<dyn Procedure>
            })
            .collect()
    }

    fn id(&self) -> &str {
        &self.workload.id
    }

    /// `host:port` of the in-VM agent.
    async fn guest_address(&self) -> Result<String> {
        let status = self.services.vms.get_microvm_status(self.id()).await?;
        let ip = status
            .address
            .ok_or_else(|| anyhow!("vm {} has no guest address", self.id()))?;
        Ok(format!("{}:{}", ip, self.services.settings.guest_agent_port))
    }

    async fn pull_image(&self) -> Result<()> {
        let image = &self.workload.image;
        self.services
            .images
            .pull_image(image)
            .await
            .with_context(|| format!("pulling image {image}"))
    }

    async fn create_snapshot(&self) -> Result<()> {
        let images = &self.services.images;
        let image = &self.workload.image;

        images.create_lease(self.id(), image).await?;
        let mount = images
            .create_snapshot(image, self.id())
            .await
            .with_context(|| format!("snapshotting image {image}"))?;

        debug!(workload_id = %self.id(), path = %mount.path.display(), "Snapshot ready");
        Ok(())
    }

    async fn create_microvm(&self) -> Result<()> {
        let w = &self.workload;
        let mount = self.services.images.snapshot_mount(&w.id).await?;

        let mut metadata = w.metadata.clone();
        metadata.insert("organization".to_string(), w.organization.clone());

        let spec = VmSpec {
            id: w.id.clone(),
            vcpus: w.resources.vcpus,
            memory_bytes: w.resources.memory_bytes,
            kernel_path: self.services.settings.kernel_path.clone(),
            boot_args: None,
            drives: vec![DriveSpec::root(mount.path)],
            network_interfaces: vec![NetworkSpec {
                id: "eth0".to_string(),
                tap_name: tap_name(&w.id),
                mac: generate_mac_address(&w.id),
                guest: None,
            }],
            metadata,
        };

        self.services.vms.create_microvm(spec).await?;
        Ok(())
    }

    /// Start the VM and wait until its agent answers.
    async fn start_microvm(&self) -> Result<()> {
        let settings = &self.services.settings;
        self.services.vms.start_microvm(self.id()).await?;

        let address = self.guest_address().await?;
        let deadline = Instant::now() + settings.boot_timeout;
        loop {
            match self.services.guest.ping(&address).await {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    return Err(anyhow!(e).context(format!(
                        "guest agent at {address} not ready after {:?}",
                        settings.boot_timeout
                    )));
                }
                Err(e) => {
                    debug!(workload_id = %self.id(), error = %e, "Guest agent not ready yet");
                }
            }
            tokio::time::sleep(settings.boot_poll_interval).await;
        }

        info!(workload_id = %self.id(), address = %address, "Guest agent ready");
        Ok(())
    }

    async fn start_runner(&self) -> Result<()> {
        let w = &self.workload;
        let token = self
            .services
            .control_plane
            .registration_token(&w.id)
            .await
            .context("fetching registration token")?;
        let address = self.guest_address().await?;

        let request = StartRunnerRequest {
            url: format!(
                "{}/{}",
                self.services.settings.runner_url.trim_end_matches('/'),
                w.organization
            ),
            token: token.token,
            name: w.id.clone(),
            labels: w.labels.clone(),
            ephemeral: true,
            disable_update: true,
            replace: true,
        };
        self.services
            .guest
            .start_runner(&address, &request)
            .await
            .context("starting runner")?;

        info!(workload_id = %w.id, organization = %w.organization, "Runner started");
        Ok(())
    }

    async fn stop_runner(&self) -> Result<()> {
        let token = self
            .services
            .control_plane
            .removal_token(self.id())
            .await
            .context("fetching removal token")?;
        let address = self.guest_address().await?;

        self.services
            .guest
            .stop_runner(&address, &StopRunnerRequest { token: token.token })
            .await
            .context("stopping runner")?;
        Ok(())
    }

    async fn delete_microvm(&self) -> Result<()> {
        match self.services.vms.delete_microvm(self.id()).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn delete_snapshot(&self) -> Result<()> {
        let images = &self.services.images;
        images.delete_snapshot(self.id()).await?;
        images.delete_lease(self.id()).await?;
        Ok(())
    }
}

#[async_trait]
impl Procedure for WorkloadProcedure {
    fn name(&self) -> &str {
        self.step.name()
    }

    async fn run(&self) -> Result<Vec<Box<dyn Procedure>>> {
        match self.step {
            Step::PullImage => self.pull_image().await?,
            Step::CreateSnapshot => self.create_snapshot().await?,
            Step::CreateMicroVm => self.create_microvm().await?,
            Step::StartMicroVm => self.start_microvm().await?,
            Step::StartRunner => self.start_runner().await?,
            Step::SetPhase(phase) => {
                self.services
                    .control_plane
                    .set_workload_phase(self.id(), phase)
                    .await?
            }
            Step::StopRunner => self.stop_runner().await?,
            Step::StopMicroVm => self.services.vms.stop_microvm(self.id()).await?,
            Step::DeleteMicroVm => self.delete_microvm().await?,
            Step::DeleteSnapshot => self.delete_snapshot().await?,
            Step::DeleteWorkload => {
                self.services
                    .control_plane
                    .delete_workload(self.id())
                    .await?
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::guest::GuestCall;
    use crate::image::MemoryImageBackend;

    fn procedure(fixture: &Fixture, step: Step) -> WorkloadProcedure {
        let workload = Workload::new("w1", WorkloadPhase::Pending, "runner:1", "acme");
        WorkloadProcedure::new(step, Arc::new(workload), fixture.services.clone())
    }

    async fn run(fixture: &Fixture, steps: &[Step]) {
        for step in steps {
            procedure(fixture, *step).run().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_runner_request() {
        let fixture = Fixture::new(MemoryImageBackend::new().with_image("runner:1"));
        run(
            &fixture,
            &[
                Step::CreateSnapshot,
                Step::CreateMicroVm,
                Step::StartMicroVm,
                Step::StartRunner,
            ],
        )
        .await;

        let start = fixture
            .guest
            .calls()
            .into_iter()
            .find_map(|call| match call {
                GuestCall::Start(address, request) => Some((address, request)),
                _ => None,
            })
            .unwrap();

        assert_eq!(start.0, "172.20.0.2:8090");
        assert_eq!(start.1.url, "https://github.com/acme");
        assert_eq!(start.1.token, "registration:w1");
        assert_eq!(start.1.name, "w1");
        assert!(start.1.ephemeral && start.1.disable_update && start.1.replace);
        assert!(fixture.images.has_lease("w1"));
    }

    #[tokio::test]
    async fn test_start_microvm_times_out_when_guest_unreachable() {
        let fixture = Fixture::new(MemoryImageBackend::new().with_image("runner:1"));
        run(&fixture, &[Step::CreateSnapshot, Step::CreateMicroVm]).await;
        fixture.guest.set_unreachable(true);

        let err = procedure(&fixture, Step::StartMicroVm)
            .run()
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not ready"));

        let pings = fixture
            .guest
            .calls()
            .iter()
            .filter(|c| matches!(c, GuestCall::Ping(_)))
            .count();
        assert!(pings > 1);
    }

    #[tokio::test]
    async fn test_delete_steps_tolerate_missing_resources() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        run(
            &fixture,
            &[Step::DeleteMicroVm, Step::DeleteSnapshot, Step::DeleteWorkload],
        )
        .await;
        assert_eq!(fixture.control_plane.deleted(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_microvm_needs_snapshot() {
        let fixture = Fixture::new(MemoryImageBackend::new());
        let err = procedure(&fixture, Step::CreateMicroVm)
            .run()
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
        assert!(fixture.vms.list_microvms().await.is_empty());
    }

    #[test]
    fn test_step_display() {
        assert_eq!(Step::PullImage.to_string(), "pull_image");
        assert_eq!(
            Step::SetPhase(WorkloadPhase::Idle).to_string(),
            "set_workload_phase=idle"
        );
    }
}
