//! Wire types for the IPAM HTTP API. Every response body carries the
//! `Response` envelope alongside type-specific fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "ReturnCode")]
    pub return_code: i32,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIpConfigRequest {
    #[serde(rename = "OrchestratorContext")]
    pub orchestrator_context: String,
    #[serde(rename = "DesiredIPAddress", skip_serializing_if = "Option::is_none")]
    pub desired_ip_address: Option<String>,
    #[serde(rename = "InfraContainerID")]
    pub infra_container_id: String,
    #[serde(rename = "InterfaceID")]
    pub interface_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodIpInfo {
    #[serde(rename = "PodIPAddress")]
    pub pod_ip_address: String,
    #[serde(rename = "PrefixLength")]
    pub prefix_length: u8,
    #[serde(rename = "DefaultGateway")]
    pub default_gateway: String,
    #[serde(rename = "DnsServers", default)]
    pub dns_servers: Vec<String>,
    #[serde(rename = "NetworkContainerPrimaryIP")]
    pub network_container_primary_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIpConfigResponse {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
    #[serde(rename = "PodIpInfo", default)]
    pub pod_ip_info: Option<PodIpInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseIpConfigRequest {
    #[serde(rename = "OrchestratorContext")]
    pub orchestrator_context: String,
    #[serde(rename = "DesiredIPAddress", skip_serializing_if = "Option::is_none")]
    pub desired_ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleResponse {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkContainerRequest {
    #[serde(rename = "NetworkContainerID")]
    pub network_container_id: String,
    #[serde(rename = "PrimaryIP")]
    pub primary_ip: String,
    #[serde(rename = "SubnetName")]
    pub subnet_name: String,
    #[serde(rename = "SubnetPrefixLength")]
    pub subnet_prefix_length: u8,
    #[serde(rename = "DefaultGateway")]
    pub default_gateway: String,
    #[serde(rename = "DnsServers", default)]
    pub dns_servers: Vec<String>,
    #[serde(rename = "Version")]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteNetworkContainerRequest {
    #[serde(rename = "NetworkContainerID")]
    pub network_container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmAgentSupportedApisResponse {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
    #[serde(rename = "SupportedApis", default)]
    pub supported_apis: Vec<String>,
}
