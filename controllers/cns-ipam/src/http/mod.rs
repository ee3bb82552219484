//! The IPAM HTTP service: a REST surface serving the CNI binary's
//! request/release calls plus NC lifecycle and debug introspection
//! endpoints (spec §4.8).

mod debug;
mod handlers;
mod metrics;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::nmagent::NetworkAgentClient;
use crate::started::StartedSignal;
use crate::state::AllocationMap;

pub use metrics::ServiceMetrics;

#[derive(Clone)]
pub struct AppState {
    pub allocations: Arc<AllocationMap>,
    pub started: Arc<StartedSignal>,
    pub metrics: Arc<ServiceMetrics>,
    pub nmagent: Arc<dyn NetworkAgentClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/network/requestipconfig", post(handlers::request_ip_config))
        .route("/network/releaseipconfig", post(handlers::release_ip_config))
        .route("/network/createorupdatenetworkcontainer", post(handlers::create_or_update_nc))
        .route("/network/deletenetworkcontainer", post(handlers::delete_nc))
        .route("/network/publishnetworkcontainer", post(handlers::publish_nc))
        .route("/network/unpublishnetworkcontainer", post(handlers::unpublish_nc))
        .route("/network/nmagentsupportedapis", post(handlers::nmagent_supported_apis))
        .route("/debug/ipaddresses", get(debug::ip_addresses))
        .route("/debug/podcontext", get(debug::pod_context))
        .route("/debug/restdata", get(debug::rest_data))
        .route("/healthz", get(debug::healthz))
        .route("/readyz", get(debug::readyz))
        .route("/metrics", get(metrics::scrape))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
