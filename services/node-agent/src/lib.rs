//! Fleet Node Agent Library
//!
//! The node agent runs on each bare-metal host and keeps ephemeral CI runner
//! VMs converged with the workloads the control plane assigns to the node.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler
//! ├── lister        (lists workloads, queues new or changed ones)
//! └── worker × N    (lock, build plan, execute, back off on failure)
//!      └── WorkloadSyncer
//!           ├── CreateWorkloadPlan / DeleteWorkloadPlan
//!           └── procedures → ImageBackend, MicroVmManager, GuestAgent, ControlPlane
//! ```
//!
//! ## Modules
//!
//! - `reconciler`: the top-level loop and worker pool
//! - `plans`: convergence plans and their procedures
//! - `microvm`: VM registry and lifecycle
//! - `runtime` / `firecracker`: VM drivers
//! - `image`: base images, snapshots and leases
//! - `client` / `guest`: control plane and in-VM agent clients

pub mod agent;
pub mod client;
pub mod config;
pub mod firecracker;
pub mod guest;
pub mod image;
pub mod microvm;
pub mod network;
pub mod plans;
pub mod reconciler;
pub mod runtime;
pub mod sync;
pub mod workload;

// Re-export commonly used types
pub use agent::Agent;
pub use client::{ControlPlane, ControlPlaneClient, MemoryControlPlane};
pub use microvm::{MicroVm, MicroVmManager, VmError, VmSpec, VmState, VmStatus};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerStats, SyncOutcome};
pub use runtime::{MockDriver, VmDriver, VmExit};
pub use workload::{PullPolicy, Workload, WorkloadPhase};
