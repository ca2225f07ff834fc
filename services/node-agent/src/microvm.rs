//! MicroVM lifecycle manager.
//!
//! The manager owns the registry of workload VMs on this node:
//! - Creating handles from a VM spec (idempotent per workload)
//! - Starting them through the driver and watching for process exit
//! - Stopping and deleting them
//!
//! The registry is the only owner of VM handles; drivers only ever see specs
//! and IDs.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::network::{AddressPool, GuestAddress, NetworkError};
use crate::runtime::{DriverError, VmDriver};

/// Errors from the VM manager.
#[derive(Debug, Error)]
pub enum VmError {
    /// No VM is registered for the workload.
    #[error("microvm not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl VmError {
    /// Returns true for the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Block device attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSpec {
    pub id: String,
    pub path: PathBuf,
    pub is_root: bool,
    pub read_only: bool,
}

impl DriveSpec {
    /// Writable root drive.
    pub fn root(path: PathBuf) -> Self {
        Self {
            id: "rootfs".to_string(),
            path,
            is_root: true,
            read_only: false,
        }
    }
}

/// Network interface attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub id: String,
    /// Host TAP device.
    pub tap_name: String,
    pub mac: String,
    /// Guest addressing; assigned by the manager on create when empty.
    pub guest: Option<GuestAddress>,
}

/// Immutable description of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    /// Workload ID the VM belongs to.
    pub id: String,
    pub vcpus: u8,
    pub memory_bytes: u64,
    pub kernel_path: PathBuf,
    /// Extra kernel arguments appended to the defaults.
    pub boot_args: Option<String>,
    pub drives: Vec<DriveSpec>,
    pub network_interfaces: Vec<NetworkSpec>,
    pub metadata: BTreeMap<String, String>,
}

impl VmSpec {
    /// Addressing of the first interface that has one.
    pub fn guest_address(&self) -> Option<GuestAddress> {
        self.network_interfaces.iter().find_map(|n| n.guest)
    }
}

/// Observed VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmState {
    /// Created but never started.
    #[default]
    Unknown,
    Running,
    Stopped,
}

/// Current status of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmStatus {
    pub state: VmState,
    /// Guest address, set once the VM has started.
    pub address: Option<Ipv4Addr>,
    /// Identifies the current boot; changes on every start.
    pub boot_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A registered VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroVm {
    pub spec: VmSpec,
    pub status: VmStatus,
}

impl MicroVm {
    pub fn is_running(&self) -> bool {
        self.status.state == VmState::Running
    }
}

type Registry = Arc<RwLock<HashMap<String, MicroVm>>>;

/// MicroVM manager.
pub struct MicroVmManager {
    /// Driver for the hypervisor process.
    driver: Arc<dyn VmDriver>,

    /// Registered VMs by workload ID.
    vms: Registry,

    /// Guest address allocation.
    addresses: Arc<AddressPool>,

    /// Counter for generating boot IDs.
    boot_counter: AtomicU64,
}

impl MicroVmManager {
    /// Create a new VM manager.
    pub fn new(driver: Arc<dyn VmDriver>, addresses: Arc<AddressPool>) -> Self {
        Self {
            driver,
            vms: Arc::new(RwLock::new(HashMap::new())),
            addresses,
            boot_counter: AtomicU64::new(0),
        }
    }

    /// Register a VM for `spec.id`.
    ///
    /// If one is already registered it is returned unchanged and `spec` is
    /// ignored.
    pub async fn create_microvm(&self, mut spec: VmSpec) -> Result<MicroVm, VmError> {
        let mut vms = self.vms.write().await;
        if let Some(existing) = vms.get(&spec.id) {
            debug!(workload_id = %spec.id, "MicroVM already exists");
            return Ok(existing.clone());
        }

        let mut assigned = Vec::new();
        for iface in spec.network_interfaces.iter_mut().filter(|n| n.guest.is_none()) {
            match self.addresses.allocate() {
                Ok(address) => {
                    iface.guest = Some(address);
                    assigned.push(address);
                }
                Err(e) => {
                    for address in &assigned {
                        self.addresses.release(address);
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            workload_id = %spec.id,
            vcpus = spec.vcpus,
            memory_mb = spec.memory_bytes / (1024 * 1024),
            guest_ip = ?spec.guest_address().map(|a| a.ip),
            "Created microvm"
        );

        let vm = MicroVm {
            spec,
            status: VmStatus::default(),
        };
        vms.insert(vm.spec.id.clone(), vm.clone());
        Ok(vm)
    }

    /// Start the VM for `id`. Starting a running VM is a no-op.
    pub async fn start_microvm(&self, id: &str) -> Result<(), VmError> {
        let spec = {
            let vms = self.vms.read().await;
            let vm = vms.get(id).ok_or_else(|| VmError::NotFound(id.to_string()))?;
            if vm.is_running() {
                debug!(workload_id = %id, "MicroVM already running");
                return Ok(());
            }
            vm.spec.clone()
        };

        self.driver.start(&spec).await?;

        let boot_id = self.next_boot_id();
        {
            let mut vms = self.vms.write().await;
            let Some(vm) = vms.get_mut(id) else {
                drop(vms);
                warn!(workload_id = %id, "MicroVM deleted while booting, stopping it");
                if let Err(e) = self.driver.stop(id).await {
                    warn!(workload_id = %id, error = %e, "Failed to stop orphaned microvm");
                }
                return Err(VmError::NotFound(id.to_string()));
            };
            vm.status = VmStatus {
                state: VmState::Running,
                address: spec.guest_address().map(|a| a.ip),
                boot_id: Some(boot_id.clone()),
                started_at: Some(Utc::now()),
            };
        }

        info!(workload_id = %id, boot_id = %boot_id, "Started microvm");
        self.monitor(id.to_string(), boot_id);
        Ok(())
    }

    /// Watch for the VM process to exit and mark the VM stopped.
    fn monitor(&self, id: String, boot_id: String) {
        let driver = Arc::clone(&self.driver);
        let vms = Arc::clone(&self.vms);

        tokio::spawn(async move {
            let exit = driver.wait(&id).await;

            {
                let mut vms = vms.write().await;
                match vms.get_mut(&id) {
                    Some(vm) if vm.status.boot_id.as_deref() == Some(boot_id.as_str()) => {
                        vm.status.state = VmState::Stopped;
                        vm.status.address = None;
                    }
                    // Deleted or restarted since; this exit is stale.
                    _ => return,
                }
            }

            match exit {
                Ok(exit) if exit.is_clean() => {
                    info!(workload_id = %id, boot_id = %boot_id, exit = ?exit, "MicroVM exited");
                }
                Ok(exit) => {
                    warn!(workload_id = %id, boot_id = %boot_id, exit = ?exit, "MicroVM exited unexpectedly");
                }
                Err(e) => {
                    debug!(workload_id = %id, error = %e, "MicroVM wait ended without exit status");
                }
            }
        });
    }

    /// Stop the VM for `id`.
    pub async fn stop_microvm(&self, id: &str) -> Result<(), VmError> {
        if !self.vms.read().await.contains_key(id) {
            return Err(VmError::NotFound(id.to_string()));
        }

        self.driver.stop(id).await?;

        if let Some(vm) = self.vms.write().await.get_mut(id) {
            vm.status.state = VmState::Stopped;
            vm.status.address = None;
        }

        info!(workload_id = %id, "Stopped microvm");
        Ok(())
    }

    /// Stop the VM for `id` if it is running, then forget it.
    pub async fn delete_microvm(&self, id: &str) -> Result<(), VmError> {
        let running = {
            let vms = self.vms.read().await;
            vms.get(id)
                .ok_or_else(|| VmError::NotFound(id.to_string()))?
                .is_running()
        };

        if running {
            match self.stop_microvm(id).await {
                Ok(()) => {}
                // Exited between the check and the stop.
                Err(VmError::Driver(DriverError::NotRunning(_))) => {}
                Err(e) => return Err(e),
            }
        }

        let removed = self.vms.write().await.remove(id);
        if let Some(vm) = removed {
            for address in vm.spec.network_interfaces.iter().filter_map(|n| n.guest) {
                self.addresses.release(&address);
            }
        }

        info!(workload_id = %id, "Deleted microvm");
        Ok(())
    }

    /// Status of the VM for `id`.
    pub async fn get_microvm_status(&self, id: &str) -> Result<VmStatus, VmError> {
        self.get_microvm(id).await.map(|vm| vm.status)
    }

    /// The VM registered for `id`.
    pub async fn get_microvm(&self, id: &str) -> Result<MicroVm, VmError> {
        self.vms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| VmError::NotFound(id.to_string()))
    }

    /// All registered VMs, ordered by workload ID.
    pub async fn list_microvms(&self) -> Vec<MicroVm> {
        let mut vms: Vec<_> = self.vms.read().await.values().cloned().collect();
        vms.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        vms
    }

    /// Generate a new boot ID.
    fn next_boot_id(&self) -> String {
        let counter = self.boot_counter.fetch_add(1, Ordering::SeqCst);
        format!("boot_{:016x}", counter)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::Subnet;
    use crate::runtime::{MockDriver, VmExit};

    fn manager() -> (Arc<MockDriver>, MicroVmManager) {
        let driver = Arc::new(MockDriver::new());
        let pool = Arc::new(AddressPool::new(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 24)));
        let manager = MicroVmManager::new(driver.clone(), pool);
        (driver, manager)
    }

    fn spec(id: &str) -> VmSpec {
        VmSpec {
            id: id.to_string(),
            vcpus: 2,
            memory_bytes: 1024 * 1024 * 1024,
            kernel_path: PathBuf::from("/vmlinux"),
            boot_args: None,
            drives: vec![DriveSpec::root(PathBuf::from("/snapshots/w1.ext4"))],
            network_interfaces: vec![NetworkSpec {
                id: "eth0".to_string(),
                tap_name: "fc-w1".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                guest: None,
            }],
            metadata: BTreeMap::new(),
        }
    }

    async fn wait_for_state(manager: &MicroVmManager, id: &str, state: VmState) {
        for _ in 0..100 {
            if manager.get_microvm_status(id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("microvm {id} never reached {state:?}");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_driver, manager) = manager();

        let first = manager.create_microvm(spec("w1")).await.unwrap();
        let mut changed = spec("w1");
        changed.vcpus = 8;
        let second = manager.create_microvm(changed).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.spec.vcpus, 2);
        assert_eq!(manager.list_microvms().await.len(), 1);
        assert_eq!(
            first.spec.guest_address().unwrap().ip,
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[tokio::test]
    async fn test_start_sets_running_and_address() {
        let (driver, manager) = manager();
        manager.create_microvm(spec("w1")).await.unwrap();

        manager.start_microvm("w1").await.unwrap();
        let status = manager.get_microvm_status("w1").await.unwrap();
        assert_eq!(status.state, VmState::Running);
        assert_eq!(status.address, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(status.boot_id.is_some());

        // Second start is a no-op.
        manager.start_microvm("w1").await.unwrap();
        assert_eq!(driver.start_count(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_stopped() {
        let (driver, manager) = manager();
        manager.create_microvm(spec("w1")).await.unwrap();
        manager.start_microvm("w1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(driver.crash("w1", VmExit::Code(1)));

        wait_for_state(&manager, "w1", VmState::Stopped).await;
        assert!(manager.get_microvm_status("w1").await.unwrap().address.is_none());
    }

    #[tokio::test]
    async fn test_stop_and_delete() {
        let (driver, manager) = manager();
        manager.create_microvm(spec("w1")).await.unwrap();
        manager.start_microvm("w1").await.unwrap();

        manager.delete_microvm("w1").await.unwrap();
        assert!(!driver.is_running("w1"));
        assert!(manager.get_microvm("w1").await.unwrap_err().is_not_found());
        assert!(manager.list_microvms().await.is_empty());

        // The address went back to the pool.
        let vm = manager.create_microvm(spec("w2")).await.unwrap();
        assert_eq!(vm.spec.guest_address().unwrap().ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let (_driver, manager) = manager();

        assert!(manager.start_microvm("nope").await.unwrap_err().is_not_found());
        assert!(manager.stop_microvm("nope").await.unwrap_err().is_not_found());
        assert!(manager.delete_microvm("nope").await.unwrap_err().is_not_found());
        assert!(manager.get_microvm_status("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_driver_failure_is_propagated() {
        let driver = Arc::new(MockDriver::failing());
        let pool = Arc::new(AddressPool::new(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 24)));
        let manager = MicroVmManager::new(driver, pool);
        manager.create_microvm(spec("w1")).await.unwrap();

        let err = manager.start_microvm("w1").await.unwrap_err();
        assert!(matches!(err, VmError::Driver(_)));
        assert_eq!(
            manager.get_microvm_status("w1").await.unwrap().state,
            VmState::Unknown
        );
    }

    /// Holds every start until a permit is added.
    struct GatedDriver {
        inner: MockDriver,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl VmDriver for GatedDriver {
        async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
            self.entered.notify_one();
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.start(spec).await
        }

        async fn stop(&self, id: &str) -> Result<(), DriverError> {
            self.inner.stop(id).await
        }

        async fn wait(&self, id: &str) -> Result<VmExit, DriverError> {
            self.inner.wait(id).await
        }
    }

    #[tokio::test]
    async fn test_delete_during_boot_stops_the_vm() {
        let driver = Arc::new(GatedDriver {
            inner: MockDriver::new(),
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let pool = Arc::new(AddressPool::new(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 24)));
        let manager = MicroVmManager::new(driver.clone(), pool);
        manager.create_microvm(spec("w1")).await.unwrap();

        let (started, ()) = tokio::join!(manager.start_microvm("w1"), async {
            driver.entered.notified().await;
            manager.delete_microvm("w1").await.unwrap();
            driver.gate.add_permits(1);
        });

        assert!(started.unwrap_err().is_not_found());
        assert_eq!(driver.inner.start_count(), 1);
        assert!(!driver.inner.is_running("w1"));
        assert!(manager.list_microvms().await.is_empty());
    }

    #[tokio::test]
    async fn test_address_exhaustion() {
        let driver = Arc::new(MockDriver::new());
        let pool = Arc::new(AddressPool::new(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 30)));
        let manager = MicroVmManager::new(driver, pool);

        manager.create_microvm(spec("w1")).await.unwrap();
        let err = manager.create_microvm(spec("w2")).await.unwrap_err();
        assert!(matches!(err, VmError::Network(NetworkError::Exhausted(_))));
    }
}
