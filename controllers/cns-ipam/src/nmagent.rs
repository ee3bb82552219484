//! Client for the on-host network agent. Publish/Unpublish and the
//! supported-APIs probe proxy through this rather than touching the
//! upstream allocator directly (spec §4.8), so a busy or unreachable
//! upstream never blocks a pod's dataplane programming.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NmAgentError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:26006";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability the HTTP handlers depend on, so tests can substitute an
/// in-memory fake instead of making real HTTP calls.
#[async_trait]
pub trait NetworkAgentClient: std::fmt::Debug + Send + Sync {
    async fn publish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError>;
    async fn unpublish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError>;
    async fn supported_apis(&self) -> Result<Vec<String>, NmAgentError>;
}

#[derive(Debug, Clone)]
pub struct NmAgentClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct NetworkContainerRequest<'a> {
    #[serde(rename = "NetworkContainerID")]
    network_container_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct AgentEnvelope {
    #[serde(rename = "ReturnCode")]
    return_code: i32,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SupportedApisResponse {
    #[serde(rename = "ReturnCode")]
    return_code: i32,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "SupportedApis", default)]
    supported_apis: Vec<String>,
}

impl NmAgentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, NmAgentError> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self { client, base_url: base_url.into() })
    }

    pub fn with_default_base_url() -> Result<Self, NmAgentError> {
        Self::new(DEFAULT_BASE_URL)
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(&self, path: &str, req: &Req) -> Result<Resp, NmAgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url, "posting to on-host network agent");
        let response = self.client.post(&url).json(req).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(NmAgentError::Transport { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(NmAgentError::from)
    }
}

#[async_trait]
impl NetworkAgentClient for NmAgentClient {
    async fn publish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError> {
        let body: AgentEnvelope = self
            .post("/network/publishnetworkcontainer", &NetworkContainerRequest { network_container_id: nc_id })
            .await?;
        check(body.return_code, &body.message)
    }

    async fn unpublish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError> {
        let body: AgentEnvelope = self
            .post("/network/unpublishnetworkcontainer", &NetworkContainerRequest { network_container_id: nc_id })
            .await?;
        check(body.return_code, &body.message)
    }

    async fn supported_apis(&self) -> Result<Vec<String>, NmAgentError> {
        let body: SupportedApisResponse = self.post("/network/nmagentsupportedapis", &()).await?;
        check(body.return_code, &body.message)?;
        Ok(body.supported_apis)
    }
}

fn check(return_code: i32, message: &str) -> Result<(), NmAgentError> {
    if return_code == 0 {
        return Ok(());
    }
    Err(NmAgentError::Application { code: return_code, message: message.to_string() })
}

#[cfg(test)]
pub mod fake {
    //! In-memory [`NetworkAgentClient`] for handler tests.
    use super::{async_trait, NetworkAgentClient, NmAgentError};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeNetworkAgentClient {
        pub fail_publish: bool,
        pub fail_unpublish: bool,
        pub supported: Vec<String>,
        pub published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NetworkAgentClient for FakeNetworkAgentClient {
        async fn publish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError> {
            if self.fail_publish {
                return Err(NmAgentError::Application { code: 1, message: "agent unreachable".to_string() });
            }
            self.published.lock().unwrap_or_else(|e| e.into_inner()).push(nc_id.to_string());
            Ok(())
        }

        async fn unpublish_network_container(&self, nc_id: &str) -> Result<(), NmAgentError> {
            if self.fail_unpublish {
                return Err(NmAgentError::Application { code: 1, message: "agent unreachable".to_string() });
            }
            self.published.lock().unwrap_or_else(|e| e.into_inner()).retain(|id| id != nc_id);
            Ok(())
        }

        async fn supported_apis(&self) -> Result<Vec<String>, NmAgentError> {
            Ok(self.supported.clone())
        }
    }
}
