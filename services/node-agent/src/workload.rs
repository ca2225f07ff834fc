//! Workload records mirrored from the control plane.
//!
//! A workload is a single-use CI job runner. The control plane owns the
//! record; the agent only reads it and converges local VMs toward it. Two
//! snapshots of the same workload are compared field by field to decide
//! whether anything changed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a workload.
///
/// Phases only move forward, except that Pending -> Idle can be observed
/// again after an agent restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    /// Assigned to this node, VM not yet ready.
    Pending,
    /// VM is up and the runner is waiting for a job.
    Idle,
    /// The runner is executing a job.
    Active,
    /// The job finished; the VM should be torn down.
    Completed,
}

impl WorkloadPhase {
    /// Whether the workload should be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// When to pull the workload image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Pull on every convergence attempt.
    Always,
    /// Pull only if the image is not present locally.
    #[default]
    IfNotPresent,
    /// Never pull; fail if the image is missing.
    Never,
}

/// Resources requested for the workload VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadResources {
    /// Virtual CPUs.
    pub vcpus: u8,
    /// Memory in bytes.
    pub memory_bytes: u64,
}

impl Default for WorkloadResources {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Desired state of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Opaque identifier, stable for the workload's lifetime.
    pub id: String,

    pub phase: WorkloadPhase,

    /// Image reference for the root filesystem.
    pub image: String,

    #[serde(default)]
    pub image_pull_policy: PullPolicy,

    #[serde(default)]
    pub resources: WorkloadResources,

    /// Runner labels.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Owning organisation.
    pub organization: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Workload {
    /// Workload with default pull policy, resources and no labels.
    pub fn new(
        id: impl Into<String>,
        phase: WorkloadPhase,
        image: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            phase,
            image: image.into(),
            image_pull_policy: PullPolicy::default(),
            resources: WorkloadResources::default(),
            labels: Vec::new(),
            organization: organization.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.image_pull_policy = policy;
        self
    }
}
