//! Control plane API client for the node agent.
//!
//! Provides methods for communicating with the control plane:
//! - Listing the workloads assigned to this node
//! - Fetching single-use runner registration and removal tokens
//! - Advancing a workload's phase and deleting finished workloads

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::Config;
use crate::workload::{Workload, WorkloadPhase};

/// Errors from HTTP collaborators (control plane, in-VM agent).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("invalid base URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ClientError {
    /// Returns true if the remote reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Status { status, .. } if *status == 404)
    }
}

/// A single-use runner token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Operations the agent needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// List every workload assigned to this node.
    async fn list_workloads(&self) -> Result<Vec<Workload>, ClientError>;

    /// Fetch a token the runner uses to register itself.
    async fn registration_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError>;

    /// Fetch a token the runner uses to deregister itself.
    async fn removal_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError>;

    /// Record a new phase for a workload.
    async fn set_workload_phase(
        &self,
        workload_id: &str,
        phase: WorkloadPhase,
    ) -> Result<(), ClientError>;

    /// Delete a workload record. Deleting an absent record succeeds.
    async fn delete_workload(&self, workload_id: &str) -> Result<(), ClientError>;
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
    node_id: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkloadList {
    workloads: Vec<Workload>,
}

#[derive(Debug, Serialize)]
struct PhaseUpdate {
    phase: WorkloadPhase,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: config.control_plane_url.clone(),
            reason: reason.to_string(),
        };
        let base_url = reqwest::Url::parse(&config.control_plane_url)
            .map_err(|e| invalid(&e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("cannot be a base"));
        }

        Ok(Self {
            client,
            base_url,
            node_id: config.node_id.clone(),
            token: config.control_plane_token.clone(),
        })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_token(&self, workload_id: &str, kind: &str) -> Result<RunnerToken, ClientError> {
        let endpoint = format!("{kind}-token");
        debug!(workload_id = %workload_id, kind, "Fetching runner token");

        let response = self
            .request(
                reqwest::Method::POST,
                &["v1", "workloads", workload_id, &endpoint],
            )
            .send()
            .await?;
        let response = check(response, workload_id).await?;
        Ok(response.json().await?)
    }
}

/// Map a non-success response to an error carrying its body.
async fn check(
    response: reqwest::Response,
    workload_id: &str,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(workload_id.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Control plane request failed");
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn list_workloads(&self) -> Result<Vec<Workload>, ClientError> {
        debug!(node_id = %self.node_id, "Listing workloads");

        let response = self
            .request(
                reqwest::Method::GET,
                &["v1", "nodes", &self.node_id, "workloads"],
            )
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list workloads");
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let list: WorkloadList = response.json().await?;
        debug!(count = list.workloads.len(), "Listed workloads");
        Ok(list.workloads)
    }

    async fn registration_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError> {
        self.fetch_token(workload_id, "registration").await
    }

    async fn removal_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError> {
        self.fetch_token(workload_id, "removal").await
    }

    async fn set_workload_phase(
        &self,
        workload_id: &str,
        phase: WorkloadPhase,
    ) -> Result<(), ClientError> {
        debug!(workload_id = %workload_id, phase = %phase, "Setting workload phase");

        let response = self
            .request(reqwest::Method::PUT, &["v1", "workloads", workload_id, "phase"])
            .json(&PhaseUpdate { phase })
            .send()
            .await?;
        check(response, workload_id).await?;
        Ok(())
    }

    async fn delete_workload(&self, workload_id: &str) -> Result<(), ClientError> {
        debug!(workload_id = %workload_id, "Deleting workload record");

        let response = self
            .request(reqwest::Method::DELETE, &["v1", "workloads", workload_id])
            .send()
            .await?;
        match check(response, workload_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory control plane for tests and local development.
///
/// Records every call so tests can assert on the side effects of a plan.
#[derive(Debug, Default)]
pub struct MemoryControlPlane {
    workloads: Mutex<Vec<Workload>>,
    phases: Mutex<HashMap<String, WorkloadPhase>>,
    deleted: Mutex<Vec<String>>,
    tokens_issued: Mutex<Vec<String>>,
    fail_listing: Mutex<bool>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the workloads returned by `list_workloads`.
    pub fn set_workloads(&self, workloads: Vec<Workload>) {
        *self.workloads.lock().unwrap_or_else(|p| p.into_inner()) = workloads;
    }

    /// Make `list_workloads` fail until reset.
    pub fn set_fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    /// Last phase recorded for a workload.
    pub fn phase(&self, workload_id: &str) -> Option<WorkloadPhase> {
        self.phases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(workload_id)
            .copied()
    }

    /// Workload IDs whose records were deleted.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Tokens issued so far, formatted as `{kind}:{workload_id}`.
    pub fn tokens_issued(&self) -> Vec<String> {
        self.tokens_issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn issue(&self, kind: &str, workload_id: &str) -> RunnerToken {
        let token = format!("{kind}:{workload_id}");
        self.tokens_issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(token.clone());
        RunnerToken {
            token,
            expires_at: None,
        }
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn list_workloads(&self) -> Result<Vec<Workload>, ClientError> {
        if *self.fail_listing.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ClientError::Status {
                status: 503,
                body: "control plane unavailable".to_string(),
            });
        }
        Ok(self.workloads.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn registration_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError> {
        Ok(self.issue("registration", workload_id))
    }

    async fn removal_token(&self, workload_id: &str) -> Result<RunnerToken, ClientError> {
        Ok(self.issue("removal", workload_id))
    }

    async fn set_workload_phase(
        &self,
        workload_id: &str,
        phase: WorkloadPhase,
    ) -> Result<(), ClientError> {
        self.phases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(workload_id.to_string(), phase);
        Ok(())
    }

    async fn delete_workload(&self, workload_id: &str) -> Result<(), ClientError> {
        self.workloads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|w| w.id != workload_id);
        self.deleted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(workload_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer, token: Option<&str>) -> ControlPlaneClient {
        let config = Config {
            control_plane_url: format!("{}/", server.uri()),
            node_id: "node-a".to_string(),
            control_plane_token: token.map(str::to_string),
            ..Config::default()
        };
        ControlPlaneClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_list_workloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/node-a/workloads"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "workloads": [{
                    "id": "w1",
                    "phase": "pending",
                    "image": "runner:1",
                    "organization": "acme"
                }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret"));
        let workloads = client.list_workloads().await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].id, "w1");
    }

    #[tokio::test]
    async fn test_list_workloads_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.list_workloads().await.unwrap_err();
        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "database down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_registration_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/workloads/w1/registration-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "AAA"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let token = client.registration_token("w1").await.unwrap();
        assert_eq!(token.token, "AAA");
        assert!(token.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_set_workload_phase() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/workloads/w1/phase"))
            .and(body_json(serde_json::json!({"phase": "idle"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client
            .set_workload_phase("w1", WorkloadPhase::Idle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ids_are_escaped_in_paths() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/workloads/org%2Fw1%3Fx/phase"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client
            .set_workload_phase("org/w1?x", WorkloadPhase::Idle)
            .await
            .unwrap();
    }

    #[test]
    fn test_url_keeps_base_path() {
        let config = Config {
            control_plane_url: "http://cp.internal/api/".to_string(),
            ..Config::default()
        };
        let client = ControlPlaneClient::new(&config).unwrap();
        assert_eq!(
            client.url(&["v1", "workloads", "a b"]).as_str(),
            "http://cp.internal/api/v1/workloads/a%20b"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let config = Config {
            control_plane_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            ControlPlaneClient::new(&config),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_workload_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/workloads/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client.delete_workload("gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_control_plane_records_calls() {
        let cp = MemoryControlPlane::new();
        cp.set_workload_phase("w1", WorkloadPhase::Idle).await.unwrap();
        cp.removal_token("w1").await.unwrap();
        cp.delete_workload("w1").await.unwrap();

        assert_eq!(cp.phase("w1"), Some(WorkloadPhase::Idle));
        assert_eq!(cp.tokens_issued(), vec!["removal:w1"]);
        assert_eq!(cp.deleted(), vec!["w1"]);

        cp.set_fail_listing(true);
        assert!(cp.list_workloads().await.is_err());
    }
}
