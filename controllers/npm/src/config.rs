//! Environment-variable configuration, collected once at startup.

use std::time::Duration;

use ruleset::model::DispatcherPlacement;

use crate::error::ControllerError;

#[derive(Debug, Clone)]
pub struct Config {
    pub watch_namespace: Option<String>,
    pub dispatcher_placement: DispatcherPlacement,
    pub reconcile_interval: Duration,
    pub lock_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        let watch_namespace = std::env::var("AZURE_CNI_WATCH_NAMESPACE").ok().filter(|s| !s.is_empty());
        let dispatcher_placement = match std::env::var("AZURE_CNI_DISPATCHER_PLACEMENT").as_deref() {
            Ok("after-kube-proxy") => DispatcherPlacement::AfterPeer,
            _ => DispatcherPlacement::First,
        };
        let reconcile_interval = std::env::var("AZURE_CNI_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        let lock_path = std::env::var("AZURE_CNI_XTABLES_LOCK").unwrap_or_else(|_| "/run/xtables.lock".to_string());

        Ok(Self {
            watch_namespace,
            dispatcher_placement,
            reconcile_interval,
            lock_path,
        })
    }
}
