//! HTTP client for the per-node IPAM service's pod IP request/release and NC
//! lifecycle surface.

pub mod client;
pub mod error;
pub mod models;

pub use client::{IpamClient, DEFAULT_BASE_URL};
pub use error::{IpamClientError, Result};
