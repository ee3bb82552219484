//! Typed HTTP client for the node's IPAM service.

use std::time::Duration;

use tracing::debug;

use crate::error::{IpamClientError, Result, RETURN_CODE_NOT_FOUND};
use crate::models::{
    DeleteNetworkContainerRequest, NetworkContainerRequest, NmAgentSupportedApisResponse,
    ReleaseIpConfigRequest, RequestIpConfigRequest, RequestIpConfigResponse, SimpleResponse,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:10090";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct IpamClient {
    client: reqwest::Client,
    base_url: String,
}

impl IpamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn with_default_base_url() -> Result<Self> {
        Self::new(DEFAULT_BASE_URL)
    }

    /// Requests an IP for a pod. On failure mid-operation the IPAM service
    /// performs a best-effort self-cancel; this client surfaces whatever
    /// error the service returned without retrying.
    pub async fn request_ip_config(&self, req: &RequestIpConfigRequest) -> Result<RequestIpConfigResponse> {
        let body: RequestIpConfigResponse = self
            .post("/network/requestipconfig", req)
            .await?;
        check_envelope(&body.response)?;
        Ok(body)
    }

    /// Idempotent: releasing a non-existent reservation is not an error.
    pub async fn release_ip_config(&self, req: &ReleaseIpConfigRequest) -> Result<()> {
        let body: SimpleResponse = self.post("/network/releaseipconfig", req).await?;
        if body.response.return_code == RETURN_CODE_NOT_FOUND {
            return Ok(());
        }
        check_envelope(&body.response)
    }

    pub async fn create_or_update_network_container(&self, req: &NetworkContainerRequest) -> Result<()> {
        let body: SimpleResponse = self
            .post("/network/createorupdatenetworkcontainer", req)
            .await?;
        check_envelope(&body.response)
    }

    pub async fn delete_network_container(&self, req: &DeleteNetworkContainerRequest) -> Result<()> {
        let body: SimpleResponse = self.post("/network/deletenetworkcontainer", req).await?;
        check_envelope(&body.response)
    }

    pub async fn publish_network_container(&self, req: &DeleteNetworkContainerRequest) -> Result<()> {
        let body: SimpleResponse = self.post("/network/publishnetworkcontainer", req).await?;
        check_envelope(&body.response)
    }

    pub async fn unpublish_network_container(&self, req: &DeleteNetworkContainerRequest) -> Result<()> {
        let body: SimpleResponse = self.post("/network/unpublishnetworkcontainer", req).await?;
        check_envelope(&body.response)
    }

    pub async fn get_nmagent_supported_apis(&self) -> Result<Vec<String>> {
        let body: NmAgentSupportedApisResponse = self.post("/network/nmagentsupportedapis", &()).await?;
        check_envelope(&body.response)?;
        Ok(body.supported_apis)
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(&self, path: &str, req: &Req) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url, "posting to ipam service");
        let response = self.client.post(&url).json(req).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(IpamClientError::Transport {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(IpamClientError::from)
    }
}

fn check_envelope(envelope: &crate::models::ResponseEnvelope) -> Result<()> {
    if envelope.return_code == 0 {
        return Ok(());
    }
    if envelope.return_code == RETURN_CODE_NOT_FOUND {
        return Err(IpamClientError::NotFound);
    }
    Err(IpamClientError::Application {
        code: envelope.return_code,
        message: envelope.message.clone(),
    })
}

#[cfg(feature = "test-util")]
pub mod mock {
    //! In-memory fake for tests that exercise callers of [`IpamClient`]
    //! without making real HTTP calls.
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockIpamClient {
        pub requests: Mutex<Vec<String>>,
    }

    impl MockIpamClient {
        pub fn record(&self, path: &str) {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(path.to_string());
        }
    }
}
