//! Configuration for the node agent.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::network::Subnet;
use crate::plans::PlanSettings;
use crate::reconciler::ReconcilerConfig;

/// Which VM driver and image backend to run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Firecracker processes and on-disk images.
    Firecracker,
    /// In-memory driver and image backend, for development.
    Mock,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "firecracker" => Ok(Self::Firecracker),
            "mock" => Ok(Self::Mock),
            other => Err(anyhow!("unknown runtime {other:?}, expected firecracker or mock")),
        }
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this node in the control plane.
    pub node_id: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Bearer token for the control plane, if required.
    pub control_plane_token: Option<String>,

    /// Data directory for images, snapshots and VM state.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub runtime: RuntimeKind,

    /// Number of convergence workers.
    pub workers: usize,

    /// Capacity of the work queue.
    pub queue_capacity: usize,

    /// Interval between workload listings.
    pub reconcile_interval: Duration,

    /// Deadline for one convergence attempt.
    pub sync_timeout: Duration,

    /// How long to wait for the in-VM agent after boot.
    pub boot_timeout: Duration,

    pub firecracker_path: PathBuf,
    pub kernel_path: PathBuf,

    /// HTTP mirror serving root-disk images.
    pub image_mirror_url: String,

    /// Port the in-VM agent listens on.
    pub guest_agent_port: u16,

    /// Subnet guest addresses are allocated from.
    pub guest_subnet: Subnet,

    /// Base URL runners register against; the organisation is appended.
    pub runner_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-local".to_string(),
            control_plane_url: "http://127.0.0.1:8080".to_string(),
            control_plane_token: None,
            data_dir: PathBuf::from("/var/lib/fleet"),
            log_level: "info".to_string(),
            runtime: RuntimeKind::Firecracker,
            workers: 4,
            queue_capacity: 1024,
            reconcile_interval: fleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
            sync_timeout: fleet_reconcile::DEFAULT_SYNC_TIMEOUT,
            boot_timeout: Duration::from_secs(30),
            firecracker_path: PathBuf::from("/usr/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/fleet/kernel/vmlinux"),
            image_mirror_url: "http://127.0.0.1:8081".to_string(),
            guest_agent_port: 8090,
            guest_subnet: Subnet::new(Ipv4Addr::new(172, 20, 0, 0), 16),
            runner_url: "https://github.com".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let node_id = lookup("FLEET_NODE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or(defaults.node_id);

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse::<u64>(&lookup, key)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let config = Self {
            node_id,
            control_plane_url: lookup("FLEET_CONTROL_PLANE_URL")
                .unwrap_or(defaults.control_plane_url),
            control_plane_token: lookup("FLEET_CONTROL_PLANE_TOKEN").filter(|t| !t.is_empty()),
            data_dir: lookup("FLEET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_level: lookup("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level),
            runtime: parse(&lookup, "FLEET_RUNTIME")?.unwrap_or(defaults.runtime),
            workers: parse(&lookup, "FLEET_WORKERS")?.unwrap_or(defaults.workers),
            queue_capacity: parse(&lookup, "FLEET_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            reconcile_interval: secs("FLEET_RECONCILE_INTERVAL", defaults.reconcile_interval)?,
            sync_timeout: secs("FLEET_SYNC_TIMEOUT", defaults.sync_timeout)?,
            boot_timeout: secs("FLEET_BOOT_TIMEOUT", defaults.boot_timeout)?,
            firecracker_path: lookup("FLEET_FIRECRACKER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.firecracker_path),
            kernel_path: lookup("FLEET_KERNEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.kernel_path),
            image_mirror_url: lookup("FLEET_IMAGE_MIRROR_URL").unwrap_or(defaults.image_mirror_url),
            guest_agent_port: parse(&lookup, "FLEET_GUEST_AGENT_PORT")?
                .unwrap_or(defaults.guest_agent_port),
            guest_subnet: parse(&lookup, "FLEET_GUEST_SUBNET")?.unwrap_or(defaults.guest_subnet),
            runner_url: lookup("FLEET_RUNNER_URL").unwrap_or(defaults.runner_url),
        };

        if config.workers == 0 {
            return Err(anyhow!("FLEET_WORKERS must be at least 1"));
        }
        if config.queue_capacity == 0 {
            return Err(anyhow!("FLEET_QUEUE_CAPACITY must be at least 1"));
        }
        if config.boot_timeout >= config.sync_timeout {
            return Err(anyhow!(
                "FLEET_BOOT_TIMEOUT ({:?}) must be shorter than FLEET_SYNC_TIMEOUT ({:?})",
                config.boot_timeout,
                config.sync_timeout
            ));
        }

        Ok(config)
    }

    /// Settings for the reconciliation loop.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            sync_timeout: self.sync_timeout,
            ..ReconcilerConfig::default()
        }
    }

    /// Settings for plan building and procedures.
    pub fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            kernel_path: self.kernel_path.clone(),
            guest_agent_port: self.guest_agent_port,
            boot_timeout: self.boot_timeout,
            runner_url: self.runner_url.clone(),
            ..PlanSettings::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("{e}"))
                .with_context(|| format!("invalid value {raw:?} for {key}"))
        })
        .transpose()
}
