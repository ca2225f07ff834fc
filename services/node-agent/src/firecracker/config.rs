//! Firecracker API request bodies.
//!
//! Each type maps one-to-one onto a Firecracker API object and is built from
//! the hypervisor-neutral [`VmSpec`].
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use std::path::PathBuf;

use serde::Serialize;

use crate::microvm::{DriveSpec, NetworkSpec, VmSpec};

/// Kernel arguments every guest boots with.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Smallest memory size Firecracker is given.
const MIN_MEM_MIB: u32 = 128;

/// `PUT /machine-config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

impl MachineConfig {
    pub fn from_spec(spec: &VmSpec) -> Self {
        let mib = (spec.memory_bytes / (1024 * 1024)).min(u64::from(u32::MAX)) as u32;
        Self {
            vcpu_count: spec.vcpus.max(1),
            mem_size_mib: mib.max(MIN_MEM_MIB),
            smt: false,
        }
    }
}

/// `PUT /boot-source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

impl BootSource {
    /// Default arguments, then guest IP configuration, then the spec's extras.
    pub fn from_spec(spec: &VmSpec) -> Self {
        let mut args = vec![DEFAULT_BOOT_ARGS.to_string()];
        if let Some(guest) = spec.guest_address() {
            args.push(guest.kernel_arg());
        }
        if let Some(extra) = spec.boot_args.as_deref().filter(|a| !a.is_empty()) {
            args.push(extra.to_string());
        }

        Self {
            kernel_image_path: spec.kernel_path.clone(),
            boot_args: args.join(" "),
        }
    }
}

/// `PUT /drives/{drive_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl From<&DriveSpec> for DriveConfig {
    fn from(drive: &DriveSpec) -> Self {
        Self {
            drive_id: drive.id.clone(),
            path_on_host: drive.path.clone(),
            is_root_device: drive.is_root,
            is_read_only: drive.read_only,
        }
    }
}

/// `PUT /network-interfaces/{iface_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

impl From<&NetworkSpec> for NetworkInterface {
    fn from(net: &NetworkSpec) -> Self {
        Self {
            iface_id: net.id.clone(),
            host_dev_name: net.tap_name.clone(),
            guest_mac: net.mac.clone(),
        }
    }
}

/// `PUT /actions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceAction {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
}
