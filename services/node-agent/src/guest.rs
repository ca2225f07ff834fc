//! Client for the agent running inside each microVM.
//!
//! The in-VM agent exposes a small JSON-over-HTTP API used to check that the
//! guest has booted and to start or stop the job runner. Any non-200 response
//! is an error carrying the response body.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClientError;

/// Timeout for a single health probe.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Request to register and start the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRunnerRequest {
    /// Organisation URL the runner registers against.
    pub url: String,
    /// Single-use registration token.
    pub token: String,
    /// Runner name.
    pub name: String,
    pub labels: Vec<String>,
    /// Run one job, then exit.
    pub ephemeral: bool,
    pub disable_update: bool,
    /// Replace a runner with the same name.
    pub replace: bool,
}

/// Request to deregister and stop the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRunnerRequest {
    /// Single-use removal token.
    pub token: String,
}

/// Operations on the in-VM agent at `address` (`host:port`).
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Succeeds once the agent answers its health endpoint.
    async fn ping(&self, address: &str) -> Result<(), ClientError>;

    async fn start_runner(
        &self,
        address: &str,
        request: &StartRunnerRequest,
    ) -> Result<(), ClientError>;

    async fn stop_runner(
        &self,
        address: &str,
        request: &StopRunnerRequest,
    ) -> Result<(), ClientError>;
}

/// HTTP client for the in-VM agent.
pub struct GuestAgentClient {
    client: reqwest::Client,
}

impl GuestAgentClient {
    pub fn new() -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        address: &str,
        path: &str,
        body: &T,
    ) -> Result<(), ClientError> {
        let url = format!("http://{address}{path}");
        debug!(url = %url, "POST to guest agent");

        let response = self.client.post(&url).json(body).send().await?;
        ensure_ok(response).await
    }
}

async fn ensure_ok(response: reqwest::Response) -> Result<(), ClientError> {
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl GuestAgent for GuestAgentClient {
    async fn ping(&self, address: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .get(format!("http://{address}/ping"))
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        ensure_ok(response).await
    }

    async fn start_runner(
        &self,
        address: &str,
        request: &StartRunnerRequest,
    ) -> Result<(), ClientError> {
        self.post(address, "/runner/start", request).await
    }

    async fn stop_runner(
        &self,
        address: &str,
        request: &StopRunnerRequest,
    ) -> Result<(), ClientError> {
        self.post(address, "/runner/stop", request).await
    }
}

/// Calls recorded by [`MockGuestAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCall {
    Ping(String),
    Start(String, StartRunnerRequest),
    Stop(String, StopRunnerRequest),
}

/// Guest agent stand-in for the mock runtime and tests.
///
/// Answers every request successfully unless told to stay unreachable.
#[derive(Debug, Default)]
pub struct MockGuestAgent {
    calls: Mutex<Vec<GuestCall>>,
    unreachable: Mutex<bool>,
}

impl MockGuestAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pings fail, as if the guest never booted.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap_or_else(|p| p.into_inner()) = unreachable;
    }

    pub fn calls(&self) -> Vec<GuestCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record(&self, call: GuestCall) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);
    }
}

#[async_trait]
impl GuestAgent for MockGuestAgent {
    async fn ping(&self, address: &str) -> Result<(), ClientError> {
        self.record(GuestCall::Ping(address.to_string()));
        if *self.unreachable.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ClientError::Status {
                status: 503,
                body: "guest not ready".to_string(),
            });
        }
        Ok(())
    }

    async fn start_runner(
        &self,
        address: &str,
        request: &StartRunnerRequest,
    ) -> Result<(), ClientError> {
        self.record(GuestCall::Start(address.to_string(), request.clone()));
        Ok(())
    }

    async fn stop_runner(
        &self,
        address: &str,
        request: &StopRunnerRequest,
    ) -> Result<(), ClientError> {
        self.record(GuestCall::Stop(address.to_string(), request.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn address(server: &MockServer) -> String {
        server.address().to_string()
    }

    #[tokio::test]
    async fn test_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = GuestAgentClient::new().unwrap();
        client.ping(&address(&server)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_runner_sends_flags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runner/start"))
            .and(body_partial_json(serde_json::json!({
                "token": "reg",
                "ephemeral": true,
                "disable_update": true,
                "replace": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GuestAgentClient::new().unwrap();
        let request = StartRunnerRequest {
            url: "https://github.com/acme".to_string(),
            token: "reg".to_string(),
            name: "w1".to_string(),
            labels: vec!["linux".to_string()],
            ephemeral: true,
            disable_update: true,
            replace: true,
        };
        client.start_runner(&address(&server), &request).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_200_is_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runner/stop"))
            .respond_with(ResponseTemplate::new(201).set_body_string("runner busy"))
            .mount(&server)
            .await;

        let client = GuestAgentClient::new().unwrap();
        let err = client
            .stop_runner(
                &address(&server),
                &StopRunnerRequest {
                    token: "rm".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("runner busy"));
    }

    #[tokio::test]
    async fn test_mock_guest_agent() {
        let agent = MockGuestAgent::new();
        agent.ping("10.0.0.2:8090").await.unwrap();

        agent.set_unreachable(true);
        assert!(agent.ping("10.0.0.2:8090").await.is_err());
        assert_eq!(agent.calls().len(), 2);
    }
}
