//! Prometheus metrics exposed on the admin server, following the gauge
//! naming the pool monitor and HTTP handlers feed into.

use axum::extract::State;
use axum::http::{header, StatusCode};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use super::AppState;

pub struct ServiceMetrics {
    pub registry: Registry,
    pub ip_requests_total: IntCounter,
    pub ip_request_failures_total: IntCounter,
    pub ip_releases_total: IntCounter,
    pub available_gauge: IntGauge,
    pub assigned_gauge: IntGauge,
    pub pending_release_gauge: IntGauge,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let ip_requests_total = IntCounter::new("cns_ipam_requests_total", "pod IP requests received").expect("static metric descriptor");
        let ip_request_failures_total = IntCounter::new("cns_ipam_request_failures_total", "pod IP requests that failed").expect("static metric descriptor");
        let ip_releases_total = IntCounter::new("cns_ipam_releases_total", "pod IP releases received").expect("static metric descriptor");
        let available_gauge = IntGauge::new("cns_ipam_available_ips", "secondary IPs currently available").expect("static metric descriptor");
        let assigned_gauge = IntGauge::new("cns_ipam_assigned_ips", "secondary IPs currently assigned").expect("static metric descriptor");
        let pending_release_gauge = IntGauge::new("cns_ipam_pending_release_ips", "secondary IPs pending release").expect("static metric descriptor");

        for metric in [&ip_requests_total, &ip_request_failures_total, &ip_releases_total] {
            registry.register(Box::new(metric.clone())).expect("metric registration is infallible for a fresh registry");
        }
        for gauge in [&available_gauge, &assigned_gauge, &pending_release_gauge] {
            registry.register(Box::new(gauge.clone())).expect("metric registration is infallible for a fresh registry");
        }

        Self {
            registry,
            ip_requests_total,
            ip_request_failures_total,
            ip_releases_total,
            available_gauge,
            assigned_gauge,
            pending_release_gauge,
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn scrape(State(state): State<AppState>) -> Result<(StatusCode, [(header::HeaderName, &'static str); 1], Vec<u8>), StatusCode> {
    let counts = state.allocations.counts().await;
    state.metrics.available_gauge.set(i64::from(counts.available));
    state.metrics.assigned_gauge.set(i64::from(counts.assigned));
    state.metrics.pending_release_gauge.set(i64::from(counts.pending_release));

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buffer))
}
