//! Host-side TAP devices for guest networking.
//!
//! Each VM interface gets a TAP device carrying the gateway address of the
//! guest's /30 block. Outbound NAT for the guest subnet is host configuration
//! and is not managed here.

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::microvm::NetworkSpec;
use crate::runtime::DriverError;

/// Create and bring up the TAP device for `net`.
pub async fn create_tap(net: &NetworkSpec) -> Result<(), DriverError> {
    let tap = net.tap_name.as_str();
    info!(tap = %tap, "Creating TAP device");

    // A stale device from a previous boot blocks creation.
    let _ = run_ip(&["link", "delete", tap]).await;

    run_ip(&["tuntap", "add", "dev", tap, "mode", "tap"]).await?;

    let result = async {
        if let Some(guest) = net.guest {
            let cidr = format!("{}/{}", guest.gateway, guest.prefix_len);
            run_ip(&["addr", "add", &cidr, "dev", tap]).await?;
        }
        run_ip(&["link", "set", "dev", tap, "up"]).await
    }
    .await;

    if let Err(e) = result {
        let _ = run_ip(&["link", "delete", tap]).await;
        return Err(e);
    }

    debug!(tap = %tap, "TAP device ready");
    Ok(())
}

/// Delete the TAP device for `net`. Failures are logged.
pub async fn delete_tap(net: &NetworkSpec) {
    if let Err(e) = run_ip(&["link", "delete", &net.tap_name]).await {
        warn!(tap = %net.tap_name, error = %e, "Failed to delete TAP device");
    }
}

async fn run_ip(args: &[&str]) -> Result<(), DriverError> {
    let output = Command::new("ip").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriverError::Api(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
