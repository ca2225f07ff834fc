//! Wiring of the agent's collaborators for a given configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::client::{ControlPlane, ControlPlaneClient};
use crate::config::{Config, RuntimeKind};
use crate::firecracker::{FirecrackerConfig, FirecrackerDriver};
use crate::guest::{GuestAgent, GuestAgentClient, MockGuestAgent};
use crate::image::{ImageBackend, LocalImageBackend, LocalImageConfig, MemoryImageBackend};
use crate::microvm::MicroVmManager;
use crate::network::AddressPool;
use crate::plans::Services;
use crate::reconciler::Reconciler;
use crate::runtime::{MockDriver, VmDriver};
use crate::sync::WorkloadSyncer;

/// A fully wired node agent.
pub struct Agent {
    reconciler: Arc<Reconciler>,
    vms: Arc<MicroVmManager>,
}

impl Agent {
    /// Build the agent for `config`.
    ///
    /// The control plane is always reached over HTTP; the runtime selects
    /// the VM driver, image backend and guest agent client.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let control_plane: Arc<dyn ControlPlane> = Arc::new(
            ControlPlaneClient::new(config).context("building control plane client")?,
        );

        let (driver, images, guest): (
            Arc<dyn VmDriver>,
            Arc<dyn ImageBackend>,
            Arc<dyn GuestAgent>,
        ) = match config.runtime {
            RuntimeKind::Firecracker => {
                let driver = FirecrackerDriver::new(FirecrackerConfig {
                    firecracker_path: config.firecracker_path.clone(),
                    run_dir: config.data_dir.join("vms"),
                    ..FirecrackerConfig::default()
                });
                let images = LocalImageBackend::new(LocalImageConfig::under(
                    &config.data_dir,
                    &config.image_mirror_url,
                ))
                .await
                .context("initialising image store")?;
                let guest = GuestAgentClient::new().context("building guest agent client")?;
                (Arc::new(driver), Arc::new(images), Arc::new(guest))
            }
            RuntimeKind::Mock => (
                Arc::new(MockDriver::new()),
                Arc::new(MemoryImageBackend::new()),
                Arc::new(MockGuestAgent::new()),
            ),
        };

        let vms = Arc::new(MicroVmManager::new(
            driver,
            Arc::new(AddressPool::new(config.guest_subnet)),
        ));

        let services = Arc::new(Services {
            control_plane: Arc::clone(&control_plane),
            images,
            vms: Arc::clone(&vms),
            guest,
            settings: config.plan_settings(),
        });

        let reconciler = Arc::new(Reconciler::new(
            config.reconciler(),
            control_plane,
            Arc::new(WorkloadSyncer::new(services)),
        ));

        info!(
            node_id = %config.node_id,
            runtime = ?config.runtime,
            guest_subnet = %config.guest_subnet,
            "Agent initialised"
        );

        Ok(Self { reconciler, vms })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn vms(&self) -> &Arc<MicroVmManager> {
        &self.vms
    }

    /// Run until `shutdown` is set.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        Arc::clone(&self.reconciler).run(shutdown).await;

        let running = self
            .vms
            .list_microvms()
            .await
            .iter()
            .filter(|vm| vm.is_running())
            .count();
        info!(running_vms = running, "Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_agent_runs_until_shutdown() {
        let config = Config {
            runtime: RuntimeKind::Mock,
            control_plane_url: "http://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        let agent = Agent::from_config(&config).await.unwrap();
        assert!(agent.vms().list_microvms().await.is_empty());

        let (stop, shutdown) = watch::channel(false);
        stop.send(true).unwrap();
        agent.run(shutdown).await;
        assert_eq!(agent.reconciler().stats().synced, 0);
    }

    #[tokio::test]
    async fn test_firecracker_agent_creates_data_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        Agent::from_config(&config).await.unwrap();
        assert!(temp.path().join("images").is_dir());
        assert!(temp.path().join("snapshots").is_dir());
    }
}
