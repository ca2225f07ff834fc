//! Fleet Node Agent
//!
//! Runs on each host and converges runner microVMs toward the workloads the
//! control plane assigns to this node.
//!
//! ## Architecture
//!
//! - **Reconciler**: lists workloads and queues the changed ones
//! - **Workers**: build and execute a plan per workload, backing off on failure
//! - **MicroVM Manager**: tracks VM handles on top of the driver
//! - **Runtime**: the VM driver and image store (mock in dev, Firecracker in prod)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_node_agent::{config::Config, Agent};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long in-flight work gets to finish after a shutdown signal.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir.display(),
        runtime = ?config.runtime,
        workers = config.workers,
        "Starting fleet node agent"
    );

    let agent = Arc::new(Agent::from_config(&config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut agent_handle = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            if let Err(e) = result {
                error!(error = %e, "Agent task failed");
            }
            return Ok(());
        }
    }

    // Signal shutdown to the lister, workers and pending retries
    let _ = shutdown_tx.send(true);

    info!(timeout_secs = STOP_TIMEOUT.as_secs(), "Waiting for workers to stop...");
    match tokio::time::timeout(STOP_TIMEOUT, agent_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Agent task failed"),
        Err(_) => warn!("Workers did not stop in time"),
    }

    info!(stats = ?agent.reconciler().stats(), "Node agent shutdown complete");
    Ok(())
}
