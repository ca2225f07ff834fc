//! Client for Firecracker's API on its Unix socket.
//!
//! Covers what the driver needs: probing the API, pre-boot configuration of a
//! [`VmSpec`] and the two instance actions.

use std::path::{Path, PathBuf};

use hyper::body::Buf;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{
    ActionType, BootSource, DriveConfig, InstanceAction, MachineConfig, NetworkInterface,
};
use crate::microvm::VmSpec;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("socket transport: {0}")]
    Http(#[from] hyper::Error),

    #[error("building request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{method} {path} returned {status}: {message}")]
    Api {
        method: Method,
        path: String,
        status: u16,
        message: String,
    },
}

/// `GET /`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    /// `Not started`, `Running` or `Paused`.
    pub state: String,
}

/// Firecracker API client bound to one VM's socket.
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Instance description; answers as soon as the API server is up.
    pub async fn describe_instance(&self) -> Result<InstanceInfo, ApiError> {
        let body = self.call(Method::GET, "/", None).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    /// Push machine, boot source, drives and interfaces for `spec`.
    pub async fn configure(&self, spec: &VmSpec) -> Result<(), ApiError> {
        self.put("/machine-config", &MachineConfig::from_spec(spec))
            .await?;
        self.put("/boot-source", &BootSource::from_spec(spec)).await?;

        for drive in spec.drives.iter().map(DriveConfig::from) {
            self.put(&format!("/drives/{}", drive.drive_id), &drive)
                .await?;
        }
        for iface in spec.network_interfaces.iter().map(NetworkInterface::from) {
            self.put(&format!("/network-interfaces/{}", iface.iface_id), &iface)
                .await?;
        }
        Ok(())
    }

    /// Boot the configured VM.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.action(ActionType::InstanceStart).await
    }

    /// Ask the guest to shut down.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.action(ActionType::SendCtrlAltDel).await
    }

    async fn action(&self, action_type: ActionType) -> Result<(), ApiError> {
        self.put("/actions", &InstanceAction { action_type }).await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        self.call(Method::PUT, path, Some(serde_json::to_vec(body)?))
            .await
            .map(drop)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<impl Buf, ApiError> {
        debug!(method = %method, path, "Firecracker API request");

        let mut request = Request::builder()
            .method(method.clone())
            .uri(Uri::new(&self.socket_path, path))
            .header("Accept", "application/json");
        if body.is_some() {
            request = request.header("Content-Type", "application/json");
        }
        let request = request.body(body.map(Body::from).unwrap_or_else(Body::empty))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;
        if status.is_success() {
            return Ok(body);
        }

        let message = fault_message(body);
        warn!(method = %method, path, status = %status, message = %message, "Firecracker API error");
        Err(ApiError::Api {
            method,
            path: path.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

/// Firecracker reports failures as `{"fault_message": "..."}`.
fn fault_message(mut body: impl Buf) -> String {
    #[derive(Deserialize)]
    struct Fault {
        fault_message: String,
    }

    let bytes = body.copy_to_bytes(body.remaining());
    match serde_json::from_slice::<Fault>(&bytes) {
        Ok(fault) => fault.fault_message,
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}
