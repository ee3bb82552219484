//! `ClusterSubnetState` CRD
//!
//! Cluster-scoped one-bit signal set by the upstream allocator when the
//! node's subnet has no more addresses to hand out. The pool monitor reads
//! this to stop requesting growth even when the threshold arithmetic would
//! otherwise ask for more.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "acn.azure.com",
    version = "v1alpha1",
    kind = "ClusterSubnetState",
    shortname = "css",
    namespaced,
    status = "ClusterSubnetStateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSubnetStateSpec {
    #[serde(default)]
    pub exhausted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSubnetStateStatus {
    #[serde(default)]
    pub observed_generation: i64,
}
