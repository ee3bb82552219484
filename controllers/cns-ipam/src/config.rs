//! Environment-variable configuration collected once at startup.

use std::time::Duration;

use crate::error::NncError;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub nnc_namespace: String,
    pub ipam_listen_addr: String,
    pub nmagent_url: String,
    pub reconcile_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, NncError> {
        let node_name = std::env::var("AZURE_CNI_NODE_NAME").unwrap_or_else(|_| "unknown-node".to_string());
        let nnc_namespace = std::env::var("AZURE_CNI_NNC_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());
        let ipam_listen_addr = std::env::var("AZURE_CNI_IPAM_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:10090".to_string());
        let nmagent_url = std::env::var("AZURE_CNI_NMAGENT_URL").unwrap_or_else(|_| crate::nmagent::DEFAULT_BASE_URL.to_string());
        let reconcile_interval = std::env::var("AZURE_CNI_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        Ok(Self {
            node_name,
            nnc_namespace,
            ipam_listen_addr,
            nmagent_url,
            reconcile_interval,
        })
    }
}
