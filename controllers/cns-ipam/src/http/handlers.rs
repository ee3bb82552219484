//! Pod-facing and NC-lifecycle handlers. Every response carries the
//! `{ "Response": { "ReturnCode", "Message" }, ... }` envelope; `ReturnCode
//! == 0` is success regardless of HTTP transport status (spec §4.9).

use axum::extract::State;
use axum::Json;
use ipam_client::models::ResponseEnvelope;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IpamError;
use crate::state::NetworkContainer;

use super::AppState;

fn ok_envelope() -> ResponseEnvelope {
    ResponseEnvelope { return_code: 0, message: "Success".to_string() }
}

fn error_envelope(err: &IpamError) -> ResponseEnvelope {
    ResponseEnvelope { return_code: err.return_code(), message: err.to_string() }
}

#[derive(Debug, Deserialize)]
pub struct RequestIpConfigBody {
    #[serde(rename = "OrchestratorContext")]
    pub orchestrator_context: String,
    #[serde(rename = "DesiredIPAddress", default)]
    pub desired_ip_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestIpConfigReply {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
    #[serde(rename = "PodIpInfo", skip_serializing_if = "Option::is_none")]
    pub pod_ip_info: Option<ipam_client::models::PodIpInfo>,
}

/// On a mid-operation failure the service performs a best-effort self
/// cancel by releasing the same context, composing both errors in the
/// returned message (spec §4.8).
pub async fn request_ip_config(State(state): State<AppState>, Json(body): Json<RequestIpConfigBody>) -> Json<RequestIpConfigReply> {
    match state.allocations.assign(&body.orchestrator_context, body.desired_ip_address.as_deref()).await {
        Ok((cfg, nc)) => {
            state.metrics.ip_requests_total.inc();
            Json(RequestIpConfigReply {
                response: ok_envelope(),
                pod_ip_info: Some(ipam_client::models::PodIpInfo {
                    pod_ip_address: cfg.ip,
                    prefix_length: nc.subnet_prefix_length,
                    default_gateway: nc.default_gateway,
                    dns_servers: nc.dns_servers,
                    network_container_primary_ip: nc.primary_ip,
                }),
            })
        }
        Err(err) => {
            state.metrics.ip_request_failures_total.inc();
            if let Err(cancel_err) = state.allocations.release(&body.orchestrator_context).await {
                warn!("self-cancel after failed request also failed: {cancel_err}");
                return Json(RequestIpConfigReply {
                    response: ResponseEnvelope {
                        return_code: err.return_code(),
                        message: format!("{err}; self-cancel also failed: {cancel_err}"),
                    },
                    pod_ip_info: None,
                });
            }
            Json(RequestIpConfigReply { response: error_envelope(&err), pod_ip_info: None })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReleaseIpConfigBody {
    #[serde(rename = "OrchestratorContext")]
    pub orchestrator_context: String,
}

#[derive(Debug, Serialize)]
pub struct SimpleReply {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
}

pub async fn release_ip_config(State(state): State<AppState>, Json(body): Json<ReleaseIpConfigBody>) -> Json<SimpleReply> {
    let _ = state.allocations.release(&body.orchestrator_context).await;
    state.metrics.ip_releases_total.inc();
    Json(SimpleReply { response: ok_envelope() })
}

#[derive(Debug, Deserialize)]
pub struct NetworkContainerBody {
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
    #[serde(rename = "Version", default)]
    pub version: i64,
    #[serde(rename = "SecondaryIPs", default)]
    pub secondary_ips: Vec<String>,
}

pub async fn create_or_update_nc(State(state): State<AppState>, Json(body): Json<NetworkContainerBody>) -> Json<SimpleReply> {
    let nc = NetworkContainer {
        id: body.network_container_id,
        primary_ip: body.primary_ip,
        subnet_name: body.subnet_name,
        subnet_prefix_length: body.subnet_prefix_length,
        default_gateway: body.default_gateway,
        dns_servers: body.dns_servers,
        version: body.version,
        published: false,
    };
    state.allocations.upsert_network_container(nc, body.secondary_ips).await;
    Json(SimpleReply { response: ok_envelope() })
}

#[derive(Debug, Deserialize)]
pub struct NcIdBody {
    #[serde(rename = "NetworkContainerID")]
    pub network_container_id: String,
}

pub async fn delete_nc(State(state): State<AppState>, Json(body): Json<NcIdBody>) -> Json<SimpleReply> {
    state.allocations.delete_network_container(&body.network_container_id).await;
    Json(SimpleReply { response: ok_envelope() })
}

/// Publish/Unpublish proxy to the on-host network agent rather than loading
/// the upstream allocator directly (spec §4.8): the local NC record only
/// flips to published/unpublished once the agent itself confirms.
pub async fn publish_nc(State(state): State<AppState>, Json(body): Json<NcIdBody>) -> Json<SimpleReply> {
    if let Err(err) = state.nmagent.publish_network_container(&body.network_container_id).await {
        let err = IpamError::from(err);
        return Json(SimpleReply { response: error_envelope(&err) });
    }
    match state.allocations.publish(&body.network_container_id).await {
        Ok(()) => Json(SimpleReply { response: ok_envelope() }),
        Err(err) => Json(SimpleReply { response: error_envelope(&err) }),
    }
}

pub async fn unpublish_nc(State(state): State<AppState>, Json(body): Json<NcIdBody>) -> Json<SimpleReply> {
    if let Err(err) = state.nmagent.unpublish_network_container(&body.network_container_id).await {
        let err = IpamError::from(err);
        return Json(SimpleReply { response: error_envelope(&err) });
    }
    match state.allocations.unpublish(&body.network_container_id).await {
        Ok(()) => Json(SimpleReply { response: ok_envelope() }),
        Err(err) => Json(SimpleReply { response: error_envelope(&err) }),
    }
}

#[derive(Debug, Serialize)]
pub struct SupportedApisReply {
    #[serde(rename = "Response")]
    pub response: ResponseEnvelope,
    #[serde(rename = "SupportedApis")]
    pub supported_apis: Vec<String>,
}

/// Probes the on-host agent for supported features, used to decide which NC
/// types this node can serve (spec §4.8).
pub async fn nmagent_supported_apis(State(state): State<AppState>) -> Json<SupportedApisReply> {
    match state.nmagent.supported_apis().await {
        Ok(supported_apis) => Json(SupportedApisReply { response: ok_envelope(), supported_apis }),
        Err(err) => {
            warn!("supported-apis probe to network agent failed: {err}");
            Json(SupportedApisReply { response: error_envelope(&IpamError::from(err)), supported_apis: vec![] })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmagent::fake::FakeNetworkAgentClient;
    use crate::started::StartedSignal;
    use crate::state::AllocationMap;
    use std::sync::Arc;

    fn state_with(nmagent: FakeNetworkAgentClient) -> AppState {
        AppState {
            allocations: Arc::new(AllocationMap::default()),
            started: Arc::new(StartedSignal::default()),
            metrics: Arc::new(crate::http::ServiceMetrics::new()),
            nmagent: Arc::new(nmagent),
        }
    }

    fn seed_nc(id: &str) -> NetworkContainer {
        NetworkContainer {
            id: id.to_string(),
            primary_ip: "10.0.0.4".to_string(),
            subnet_name: "subnet1".to_string(),
            subnet_prefix_length: 24,
            default_gateway: "10.0.0.1".to_string(),
            dns_servers: vec![],
            version: 1,
            published: false,
        }
    }

    #[tokio::test]
    async fn publish_nc_flips_local_state_only_after_the_agent_confirms() {
        let state = state_with(FakeNetworkAgentClient::default());
        state.allocations.upsert_network_container(seed_nc("nc1"), vec![]).await;

        let reply = publish_nc(State(state), Json(NcIdBody { network_container_id: "nc1".to_string() })).await;
        assert_eq!(reply.0.response.return_code, 0);
    }

    #[tokio::test]
    async fn publish_nc_surfaces_the_agent_error_without_touching_local_state() {
        let state = state_with(FakeNetworkAgentClient { fail_publish: true, ..Default::default() });
        state.allocations.upsert_network_container(seed_nc("nc1"), vec![]).await;

        let reply = publish_nc(State(state), Json(NcIdBody { network_container_id: "nc1".to_string() })).await;
        assert_ne!(reply.0.response.return_code, 0);
    }

    #[tokio::test]
    async fn supported_apis_passes_through_the_agents_list() {
        let state = state_with(FakeNetworkAgentClient {
            supported: vec!["NetworkManagement/interfaces".to_string()],
            ..Default::default()
        });

        let reply = nmagent_supported_apis(State(state)).await;
        assert_eq!(reply.0.supported_apis, vec!["NetworkManagement/interfaces".to_string()]);
    }
}
