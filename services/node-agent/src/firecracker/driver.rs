//! Firecracker implementation of [`VmDriver`].
//!
//! One `firecracker` process per VM, configured over its API socket before
//! boot. A monitor task owns each process: it reaps the exit status, tears
//! down the VM's TAP devices and run directory, then publishes the exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::api::FirecrackerClient;
use super::tap;
use crate::microvm::{NetworkSpec, VmSpec};
use crate::runtime::{DriverError, VmDriver, VmExit};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Path to the firecracker binary.
    pub firecracker_path: PathBuf,
    /// Per-VM sockets and logs live under `{run_dir}/{id}/`.
    pub run_dir: PathBuf,
    /// How long to wait for the API socket after launch.
    pub socket_timeout: Duration,
    /// How long a guest gets to shut down after CtrlAltDel.
    pub stop_grace: Duration,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/bin/firecracker"),
            run_dir: PathBuf::from("/var/lib/fleet-agent/vms"),
            socket_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// A launched VM process.
struct Instance {
    socket_path: PathBuf,
    exit: watch::Receiver<Option<VmExit>>,
    kill: Option<oneshot::Sender<()>>,
}

impl Instance {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

/// Firecracker VM driver.
pub struct FirecrackerDriver {
    config: FirecrackerConfig,
    instances: Mutex<HashMap<String, Instance>>,
}

impl FirecrackerDriver {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.config.run_dir.join(id)
    }

    /// Launch the process and wait until its API answers.
    async fn launch(&self, id: &str) -> Result<(Child, PathBuf), DriverError> {
        let dir = self.vm_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let socket_path = dir.join("firecracker.socket");
        if tokio::fs::try_exists(&socket_path).await? {
            tokio::fs::remove_file(&socket_path).await?;
        }

        let log = std::fs::File::create(dir.join("firecracker.log"))?;
        let mut child = Command::new(&self.config.firecracker_path)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(id)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .kill_on_drop(true)
            .spawn()?;

        let client = FirecrackerClient::new(&socket_path);
        let deadline = tokio::time::Instant::now() + self.config.socket_timeout;
        loop {
            if tokio::fs::try_exists(&socket_path).await? {
                match client.describe_instance().await {
                    Ok(info) => {
                        debug!(workload_id = %id, state = %info.state, "Firecracker API ready");
                        return Ok((child, socket_path));
                    }
                    Err(e) => debug!(workload_id = %id, error = %e, "Firecracker API not ready"),
                }
            }
            if let Some(status) = child.try_wait()? {
                return Err(DriverError::Api(format!(
                    "firecracker exited during launch: {status}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Api(format!(
                    "API socket {} did not appear",
                    socket_path.display()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn cleanup(dir: PathBuf, nets: &[NetworkSpec]) {
        for net in nets {
            tap::delete_tap(net).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Failed to remove VM directory");
            }
        }
    }
}

/// Own the process until it exits, then clean up and publish the exit.
async fn monitor(
    id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<VmExit>>,
    dir: PathBuf,
    nets: Vec<NetworkSpec>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill => {
            debug!(workload_id = %id, "Killing firecracker process");
            if let Err(e) = child.start_kill() {
                warn!(workload_id = %id, error = %e, "Failed to kill firecracker process");
            }
            child.wait().await
        }
    };

    let vm_exit = match status {
        Ok(status) => VmExit::from(status),
        Err(e) => {
            error!(workload_id = %id, error = %e, "Failed to reap firecracker process");
            VmExit::Code(-1)
        }
    };

    FirecrackerDriver::cleanup(dir, &nets).await;
    debug!(workload_id = %id, exit = ?vm_exit, "Firecracker process exited");
    exit.send_replace(Some(vm_exit));
}

#[async_trait]
impl VmDriver for FirecrackerDriver {
    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let id = spec.id.as_str();
        {
            let mut instances = self.instances.lock().await;
            if let Some(existing) = instances.get(id) {
                if !existing.exited() {
                    return Err(DriverError::Api(format!("vm {id} is already running")));
                }
                instances.remove(id);
            }
        }

        info!(
            workload_id = %id,
            vcpus = spec.vcpus,
            memory_mb = spec.memory_bytes / (1024 * 1024),
            "Starting Firecracker VM"
        );

        for net in &spec.network_interfaces {
            tap::create_tap(net).await?;
        }

        let (mut child, socket_path) = match self.launch(id).await {
            Ok(launched) => launched,
            Err(e) => {
                Self::cleanup(self.vm_dir(id), &spec.network_interfaces).await;
                return Err(e);
            }
        };

        let client = FirecrackerClient::new(&socket_path);
        let booted = match client.configure(spec).await {
            Ok(()) => client.start_instance().await,
            Err(e) => Err(e),
        };
        if let Err(e) = booted {
            error!(workload_id = %id, error = %e, "Failed to configure VM");
            let _ = child.kill().await;
            Self::cleanup(self.vm_dir(id), &spec.network_interfaces).await;
            return Err(DriverError::Api(e.to_string()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(
            id.to_string(),
            child,
            kill_rx,
            exit_tx,
            self.vm_dir(id),
            spec.network_interfaces.clone(),
        ));

        self.instances.lock().await.insert(
            id.to_string(),
            Instance {
                socket_path,
                exit: exit_rx,
                kill: Some(kill_tx),
            },
        );

        info!(workload_id = %id, "VM booted");
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), DriverError> {
        let (socket_path, mut exit, kill) = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .remove(id)
                .filter(|i| !i.exited())
                .ok_or_else(|| DriverError::NotRunning(id.to_string()))?;
            (instance.socket_path, instance.exit, instance.kill)
        };

        info!(workload_id = %id, "Stopping Firecracker VM");

        let client = FirecrackerClient::new(&socket_path);
        match client.send_ctrl_alt_del().await {
            Ok(()) => {
                let graceful = matches!(
                    tokio::time::timeout(self.config.stop_grace, exit.wait_for(Option::is_some))
                        .await,
                    Ok(Ok(_))
                );
                if graceful {
                    return Ok(());
                }
                warn!(workload_id = %id, "Guest did not shut down in time, killing");
            }
            Err(e) => {
                warn!(workload_id = %id, error = %e, "CtrlAltDel failed, killing");
            }
        }

        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        exit.wait_for(Option::is_some)
            .await
            .map(|_| ())
            .map_err(|_| DriverError::Stop {
                id: id.to_string(),
                reason: "monitor task ended without an exit status".to_string(),
            })
    }

    async fn wait(&self, id: &str) -> Result<VmExit, DriverError> {
        let mut exit = self
            .instances
            .lock()
            .await
            .get(id)
            .map(|i| i.exit.clone())
            .ok_or_else(|| DriverError::NotRunning(id.to_string()))?;

        let vm_exit = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::NotRunning(id.to_string()))?
            .unwrap_or(VmExit::Success);
        Ok(vm_exit)
    }
}
