//! Diagnostics endpoints and the admin server's health/readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct DebugIpAddress {
    pub ip: String,
    pub nc_id: String,
    pub state: &'static str,
    pub owning_context: Option<String>,
}

pub async fn ip_addresses(State(state): State<AppState>) -> Json<Vec<DebugIpAddress>> {
    let configs = state.allocations.debug_ip_addresses().await;
    Json(
        configs
            .into_iter()
            .map(|cfg| DebugIpAddress {
                ip: cfg.ip,
                nc_id: cfg.nc_id,
                state: match cfg.state {
                    crate::state::IpConfigState::Available => "available",
                    crate::state::IpConfigState::Assigned => "assigned",
                    crate::state::IpConfigState::PendingRelease => "pending-release",
                    crate::state::IpConfigState::PendingProgramming => "pending-programming",
                },
                owning_context: cfg.owning_context,
            })
            .collect(),
    )
}

pub async fn pod_context(State(state): State<AppState>) -> Json<std::collections::HashMap<String, String>> {
    Json(state.allocations.debug_pod_context().await)
}

#[derive(Debug, Serialize)]
pub struct RestDataSnapshot {
    pub available: u32,
    pub assigned: u32,
    pub pending_release: u32,
    pub pending_programming: u32,
}

pub async fn rest_data(State(state): State<AppState>) -> Json<RestDataSnapshot> {
    let counts = state.allocations.counts().await;
    Json(RestDataSnapshot {
        available: counts.available,
        assigned: counts.assigned,
        pending_release: counts.pending_release,
        pending_programming: counts.pending_programming,
    })
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Ready once the NNC reconciler has completed at least one reconcile (the
/// "started" signal from spec §4.6 step 5).
pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.started.is_started() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
