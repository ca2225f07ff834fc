//! Firecracker microVM driver.
//!
//! ## Components
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: API request bodies built from a [`VmSpec`](crate::microvm::VmSpec)
//! - `tap`: host TAP devices for guest interfaces
//! - `driver`: the [`VmDriver`](crate::runtime::VmDriver) implementation

mod api;
mod config;
mod driver;
mod tap;

pub use api::{ApiError, FirecrackerClient, InstanceInfo};
pub use config::DEFAULT_BOOT_ARGS;
pub use driver::{FirecrackerConfig, FirecrackerDriver};
