//! Errors for the IPAM HTTP client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpamClientError {
    #[error("request to IPAM service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IPAM service returned a non-success transport status {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("IPAM service returned application error {code}: {message}")]
    Application { code: i32, message: String },

    #[error("requested ip config not found")]
    NotFound,

    #[error("failed to decode IPAM response body: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IpamClientError>;

/// Response code reserved by the wire contract for "not found"; clients
/// distinguish it so callers can retry-delete-then-add.
pub const RETURN_CODE_NOT_FOUND: i32 = 4;
