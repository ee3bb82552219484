//! `NodeNetworkConfig` CRD
//!
//! Per-node resource describing how many secondary IPs are requested, reserved,
//! and in use. The spec is owned by the pool monitor; the status is written by
//! the upstream IP allocator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "acn.azure.com",
    version = "v1alpha1",
    kind = "NodeNetworkConfig",
    shortname = "nnc",
    namespaced,
    status = "NodeNetworkConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigSpec {
    /// Total secondary IP count this node wants the allocator to reserve.
    #[serde(default)]
    pub requested_ip_count: i64,

    /// Secondary IP ids the pool monitor has asked the allocator to reclaim.
    /// Only the pool monitor is allowed to mutate this field.
    #[serde(default)]
    pub ip_s_not_in_use: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigStatus {
    /// Scaling parameters the allocator advertises for this node.
    #[serde(default)]
    pub scaler: Scaler,

    /// Network containers currently assigned to this node.
    #[serde(default)]
    pub network_containers: Vec<NetworkContainer>,
}

/// Batching parameters that drive the pool monitor's request/release decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scaler {
    pub batch_size: i64,
    pub release_threshold_percent: i64,
    pub request_threshold_percent: i64,
    pub max_ip_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContainer {
    pub id: String,
    pub version: i64,
    pub assignment_mode: AssignmentMode,
    pub subnet_name: String,
    pub subnet_prefix_length: u8,
    pub primary_ip: String,
    pub default_gateway: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub ip_assignments: Vec<IpAssignment>,
}

/// A single secondary IP slot owned by a [`NetworkContainer`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpAssignment {
    /// Secondary ipconfig id, stable across reconciles.
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AssignmentMode {
    #[default]
    Dynamic,
    Static,
}
