//! VM driver interface and mock implementation.
//!
//! The driver abstracts the hypervisor process:
//! - Launching a configured microVM
//! - Stopping it
//! - Waiting for the process to exit
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::microvm::VmSpec;

/// Errors from a VM driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("vm {0} is not running")]
    NotRunning(String),

    #[error("failed to launch vm process: {0}")]
    Launch(#[from] std::io::Error),

    #[error("vm api error: {0}")]
    Api(String),

    #[error("vm {id} did not stop: {reason}")]
    Stop { id: String, reason: String },
}

/// How a VM process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// Exited with status 0.
    Success,
    /// Exited with a non-zero status.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
}

impl VmExit {
    /// Whether the exit is expected: a zero status or a termination signal
    /// the agent itself sends when stopping VMs.
    pub fn is_clean(&self) -> bool {
        match self {
            Self::Success => true,
            Self::Code(_) => false,
            Self::Signal(sig) => matches!(*sig, libc::SIGTERM | libc::SIGKILL | libc::SIGINT),
        }
    }
}

impl From<std::process::ExitStatus> for VmExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(0), _) => Self::Success,
            (Some(code), _) => Self::Code(code),
            (None, Some(sig)) => Self::Signal(sig),
            (None, None) => Self::Code(-1),
        }
    }
}

/// Hypervisor process driver.
#[async_trait]
pub trait VmDriver: Send + Sync {
    /// Launch and boot a VM for `spec`.
    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError>;

    /// Stop the VM process for `id`.
    async fn stop(&self, id: &str) -> Result<(), DriverError>;

    /// Block until the VM process for `id` exits.
    async fn wait(&self, id: &str) -> Result<VmExit, DriverError>;
}

/// Mock driver for testing and development.
///
/// "VMs" are entries in a map; they run until stopped or crashed.
pub struct MockDriver {
    /// Exit channels of running VMs.
    running: Mutex<HashMap<String, watch::Sender<Option<VmExit>>>>,

    /// Counter of successful starts.
    starts: AtomicU64,

    /// Whether VMs should "fail" to start.
    fail_starts: bool,
}

impl MockDriver {
    /// Create a new mock driver.
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            starts: AtomicU64::new(0),
            fail_starts: false,
        }
    }

    /// Create a mock driver that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Whether a VM is currently running.
    pub fn is_running(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of successful starts so far.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Simulate the VM process exiting on its own.
    pub fn crash(&self, id: &str, exit: VmExit) -> bool {
        match self.lock().remove(id) {
            Some(tx) => {
                tx.send_replace(Some(exit));
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<Option<VmExit>>>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
        if self.fail_starts {
            return Err(DriverError::Api("mock driver configured to fail".to_string()));
        }

        info!(
            workload_id = %spec.id,
            vcpus = spec.vcpus,
            memory_mb = spec.memory_bytes / (1024 * 1024),
            drives = spec.drives.len(),
            "[MOCK] Starting VM"
        );

        let (tx, _rx) = watch::channel(None);
        self.lock().insert(spec.id.clone(), tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), DriverError> {
        info!(workload_id = %id, "[MOCK] Stopping VM");

        let tx = self
            .lock()
            .remove(id)
            .ok_or_else(|| DriverError::NotRunning(id.to_string()))?;
        tx.send_replace(Some(VmExit::Signal(libc::SIGTERM)));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<VmExit, DriverError> {
        let mut rx = self
            .lock()
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| DriverError::NotRunning(id.to_string()))?;

        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::NotRunning(id.to_string()))?
            .unwrap_or(VmExit::Success);

        debug!(workload_id = %id, exit = ?exit, "[MOCK] VM exited");
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn test_spec(id: &str) -> VmSpec {
        VmSpec {
            id: id.to_string(),
            vcpus: 1,
            memory_bytes: 512 * 1024 * 1024,
            kernel_path: PathBuf::from("/vmlinux"),
            boot_args: None,
            drives: vec![],
            network_interfaces: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_mock_driver_start_stop() {
        let driver = MockDriver::new();
        driver.start(&test_spec("w1")).await.unwrap();
        assert!(driver.is_running("w1"));
        assert_eq!(driver.start_count(), 1);

        driver.stop("w1").await.unwrap();
        assert!(!driver.is_running("w1"));
        assert!(matches!(
            driver.stop("w1").await,
            Err(DriverError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_driver_wait_observes_stop() {
        let driver = std::sync::Arc::new(MockDriver::new());
        driver.start(&test_spec("w1")).await.unwrap();

        let waiter = {
            let driver = std::sync::Arc::clone(&driver);
            tokio::spawn(async move { driver.wait("w1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        driver.stop("w1").await.unwrap();

        let exit = waiter.await.unwrap().unwrap();
        assert_eq!(exit, VmExit::Signal(libc::SIGTERM));
        assert!(exit.is_clean());
    }

    #[tokio::test]
    async fn test_mock_driver_failing() {
        let driver = MockDriver::failing();
        assert!(driver.start(&test_spec("w1")).await.is_err());
        assert!(!driver.is_running("w1"));
    }

    #[test]
    fn test_exit_classification() {
        assert!(VmExit::Success.is_clean());
        assert!(VmExit::Signal(libc::SIGKILL).is_clean());
        assert!(!VmExit::Signal(libc::SIGSEGV).is_clean());
        assert!(!VmExit::Code(1).is_clean());
    }
}
