//! Error types for the NNC reconciler, pool monitor, and IPAM HTTP service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NncError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to build network agent client: {0}")]
    NmAgent(#[from] NmAgentError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("a patch is already in flight")]
    PatchInFlight,
}

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("ip configuration {0} not found")]
    NotFound(String),

    #[error("network container {0} not found")]
    UnknownNetworkContainer(String),

    #[error("no available ip in pool")]
    PoolExhausted,

    #[error("orchestrator context {0} already has an assigned ip")]
    AlreadyAssigned(String),

    #[error("on-host network agent: {0}")]
    NmAgent(#[from] NmAgentError),
}

impl IpamError {
    /// Maps to the wire contract's `ReturnCode` enumeration (spec §4.9 /
    /// glossary "Response code").
    pub fn return_code(&self) -> i32 {
        match self {
            IpamError::NotFound(_) => 4,
            IpamError::UnknownNetworkContainer(_) => 1,
            IpamError::PoolExhausted => 2,
            IpamError::AlreadyAssigned(_) => 3,
            IpamError::NmAgent(_) => 5,
        }
    }
}

/// Errors talking to the on-host network agent that Publish/Unpublish and
/// the supported-APIs probe proxy through to (spec §4.8).
#[derive(Debug, Error)]
pub enum NmAgentError {
    #[error("request to network agent failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("network agent returned a non-success transport status {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("network agent returned application error {code}: {message}")]
    Application { code: i32, message: String },

    #[error("failed to decode network agent response body: {0}")]
    Decode(#[from] serde_json::Error),
}
