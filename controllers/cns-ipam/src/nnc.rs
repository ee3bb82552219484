//! `NodeNetworkConfig` reconciler (spec §4.6). Watches the per-node NNC,
//! applies each described network container to the IPAM service's state,
//! and notifies the pool monitor once per reconcile for dynamic NCs.

use std::sync::Arc;

use crds::{AssignmentMode, NodeNetworkConfig};
use kube::api::Api;
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::NncError;
use crate::started::StartedSignal;
use crate::state::{AllocationMap, NetworkContainer};

/// Signal threaded to the pool monitor: fires once per reconciliation that
/// applied at least one dynamic NC, carrying the reconciler's latest scaler
/// snapshot so the monitor doesn't need to re-fetch the NNC itself.
pub type NncObservedSender = watch::Sender<Option<crds::Scaler>>;

pub struct NncReconciler {
    pub api: Api<NodeNetworkConfig>,
    pub allocations: Arc<AllocationMap>,
    pub node_name: String,
    observed_tx: NncObservedSender,
    started: Arc<StartedSignal>,
}

impl NncReconciler {
    pub fn new(
        api: Api<NodeNetworkConfig>,
        allocations: Arc<AllocationMap>,
        node_name: String,
        started: Arc<StartedSignal>,
    ) -> (Self, watch::Receiver<Option<crds::Scaler>>) {
        let (tx, rx) = watch::channel(None);
        let reconciler = Self {
            api,
            allocations,
            node_name,
            observed_tx: tx,
            started,
        };
        (reconciler, rx)
    }

    pub async fn reconcile(&self, name: &str) -> Result<(), NncError> {
        let nnc = match self.api.get_opt(name).await? {
            Some(nnc) => nnc,
            None => {
                info!(name, "NodeNetworkConfig deleted, treating as permanent removal");
                return Ok(());
            }
        };

        let status = nnc.status.clone().unwrap_or_default();
        let mut applied_dynamic = false;

        for nc in &status.network_containers {
            let secondary_ips: Vec<String> = nc.ip_assignments.iter().map(|a| a.ip.clone()).collect();
            let state_nc = NetworkContainer {
                id: nc.id.clone(),
                primary_ip: nc.primary_ip.clone(),
                subnet_name: nc.subnet_name.clone(),
                subnet_prefix_length: nc.subnet_prefix_length,
                default_gateway: nc.default_gateway.clone(),
                dns_servers: nc.dns_servers.clone(),
                version: nc.version,
                published: false,
            };
            self.allocations.upsert_network_container(state_nc, secondary_ips).await;

            if matches!(nc.assignment_mode, AssignmentMode::Dynamic) {
                applied_dynamic = true;
            }
            info!(nc_id = %nc.id, namespace = %nnc.namespace().unwrap_or_default(), "network container applied");
        }

        if applied_dynamic {
            let _ = self.observed_tx.send(Some(status.scaler));
        }

        self.started.mark();

        Ok(())
    }

    pub async fn handle_delete(&self, name: &str) {
        warn!(name, "NodeNetworkConfig delete event observed");
    }
}
