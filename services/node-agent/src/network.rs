//! Guest network addressing.
//!
//! Each microVM gets a dedicated TAP device and a point-to-point /30 carved
//! out of the configured guest subnet:
//!
//! - `.0` network, `.1` host side of the TAP (guest gateway), `.2` guest, `.3`
//!   broadcast.
//!
//! The guest address is how the agent reaches the in-VM runner agent.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from address allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("guest subnet {0} has no free addresses")]
    Exhausted(Subnet),
}

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet. Host bits of `network` are cleared.
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        let mask = mask(prefix_len);
        Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix_len,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of /30 blocks that fit in the subnet.
    pub fn block_count(&self) -> u32 {
        if self.prefix_len > 30 {
            0
        } else {
            1u32 << (30 - self.prefix_len)
        }
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidSubnet(s.to_string()))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetworkError::InvalidSubnet(s.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 30)
            .ok_or_else(|| NetworkError::InvalidSubnet(s.to_string()))?;
        Ok(Self::new(network, prefix_len))
    }
}

/// Addressing for one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestAddress {
    /// Address configured inside the guest.
    pub ip: Ipv4Addr,
    /// Host side of the TAP device.
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

impl GuestAddress {
    /// Kernel `ip=` boot argument configuring eth0 statically.
    pub fn kernel_arg(&self) -> String {
        let netmask = Ipv4Addr::from(mask(self.prefix_len));
        format!("ip={}::{}:{}::eth0:off", self.ip, self.gateway, netmask)
    }
}

/// Allocates /30 guest blocks from a subnet.
#[derive(Debug)]
pub struct AddressPool {
    subnet: Subnet,
    allocated: Mutex<BTreeSet<u32>>,
}

impl AddressPool {
    pub fn new(subnet: Subnet) -> Self {
        Self {
            subnet,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free block.
    pub fn allocate(&self) -> Result<GuestAddress, NetworkError> {
        let mut allocated = self.allocated.lock().unwrap_or_else(|p| p.into_inner());
        let block = (0..self.subnet.block_count())
            .find(|b| !allocated.contains(b))
            .ok_or(NetworkError::Exhausted(self.subnet))?;
        allocated.insert(block);

        let base = u32::from(self.subnet.network) + block * 4;
        Ok(GuestAddress {
            ip: Ipv4Addr::from(base + 2),
            gateway: Ipv4Addr::from(base + 1),
            prefix_len: 30,
        })
    }

    /// Return a guest's block to the pool. Unknown addresses are ignored.
    pub fn release(&self, address: &GuestAddress) {
        let offset = u32::from(address.ip).wrapping_sub(u32::from(self.subnet.network));
        let block = offset / 4;
        self.allocated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&block);
    }

    /// Number of allocated blocks.
    pub fn in_use(&self) -> usize {
        self.allocated.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// TAP device name for a workload.
///
/// Interface names are limited to 15 bytes: `fc-` plus 12 hex digits of the
/// ID's digest.
pub fn tap_name(workload_id: &str) -> String {
    let digest = Sha256::digest(workload_id.as_bytes());
    format!("fc-{}", hex::encode(&digest[..6]))
}

/// Deterministic, locally administered unicast MAC for a workload.
pub fn generate_mac_address(workload_id: &str) -> String {
    let digest = Sha256::digest(workload_id.as_bytes());
    let first = (digest[0] & 0xFC) | 0x02;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first, digest[1], digest[2], digest[3], digest[4], digest[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subnet() {
        let subnet: Subnet = "172.20.5.9/16".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(172, 20, 0, 0));
        assert_eq!(subnet.to_string(), "172.20.0.0/16");
        assert_eq!(subnet.block_count(), 1 << 14);

        assert!("172.20.0.0".parse::<Subnet>().is_err());
        assert!("172.20.0.0/31".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_allocate_and_release() {
        let pool = AddressPool::new("10.0.0.0/29".parse().unwrap());

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(a.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(b.ip, Ipv4Addr::new(10, 0, 0, 6));
        assert!(matches!(pool.allocate(), Err(NetworkError::Exhausted(_))));

        pool.release(&a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_kernel_arg() {
        let address = GuestAddress {
            ip: Ipv4Addr::new(10, 0, 0, 2),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            prefix_len: 30,
        };
        assert_eq!(
            address.kernel_arg(),
            "ip=10.0.0.2::10.0.0.1:255.255.255.252::eth0:off"
        );
    }

    #[test]
    fn test_tap_name_fits_ifnamsiz() {
        let name = tap_name("workload-0123456789abcdef");
        assert_eq!(name.len(), 15);
        assert!(name.starts_with("fc-"));
        assert_eq!(name, tap_name("workload-0123456789abcdef"));
    }

    #[test]
    fn test_tap_name_distinct_for_shared_suffix() {
        assert_ne!(tap_name("build-a-00000001"), tap_name("build-b-00000001"));
        assert_ne!(tap_name("org/w1"), tap_name("org_w1"));
    }

    #[test]
    fn test_generate_mac_address() {
        let mac1 = generate_mac_address("w1");
        let mac2 = generate_mac_address("w2");

        assert_eq!(mac1, generate_mac_address("w1"));
        assert_ne!(mac1, mac2);
        assert_eq!(mac1.len(), 17);

        let first = u8::from_str_radix(&mac1[..2], 16).unwrap();
        assert_eq!(first & 0x03, 0x02);
    }
}
