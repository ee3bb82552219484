//! Wires the NNC watcher, pool monitor, and IPAM HTTP service together and
//! runs them to completion, mirroring the sibling NPM controller's pattern of
//! one `JoinHandle` per task and a single `tokio::select!` that returns as
//! soon as any of them exits.

use std::sync::Arc;

use kube::api::Api;
use kube::Client;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::NncError;
use crate::http::{router, AppState, ServiceMetrics};
use crate::nmagent::NmAgentClient;
use crate::nnc::NncReconciler;
use crate::pool::PoolMonitor;
use crate::started::StartedSignal;
use crate::state::AllocationMap;
use crate::watcher::watch_nnc;

pub struct Controller {
    nnc_watcher: JoinHandle<()>,
    pool_monitor: JoinHandle<()>,
    http_server: JoinHandle<()>,
    stop: CancellationToken,
}

impl Controller {
    pub async fn new(client: Client, config: Config) -> Result<Self, NncError> {
        let allocations = Arc::new(AllocationMap::default());
        let started = Arc::new(StartedSignal::default());
        let stop = CancellationToken::new();

        let nnc_api: Api<crds::NodeNetworkConfig> = Api::namespaced(client.clone(), &config.nnc_namespace);

        let (reconciler, observed_rx) = NncReconciler::new(nnc_api.clone(), allocations.clone(), config.node_name.clone(), started.clone());
        let reconciler = Arc::new(reconciler);
        let nnc_watcher = tokio::spawn(watch_nnc(nnc_api.clone(), config.node_name.clone(), reconciler.clone(), stop.child_token()));

        let monitor = Arc::new(PoolMonitor::new(nnc_api, allocations.clone(), config.node_name.clone()));
        let requested_ip_count = Arc::new(tokio::sync::Mutex::new(0_i64));
        let mut ticker = interval(config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let pool_monitor = tokio::spawn(monitor.run(observed_rx, ticker, requested_ip_count, stop.child_token()));

        let metrics = Arc::new(ServiceMetrics::new());
        let nmagent: Arc<dyn crate::nmagent::NetworkAgentClient> = Arc::new(NmAgentClient::new(config.nmagent_url.clone())?);
        let app_state = AppState { allocations, started, metrics, nmagent };
        let listen_addr = config.ipam_listen_addr.clone();
        let http_stop = stop.child_token();
        let http_server = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!("failed to bind IPAM HTTP listener on {listen_addr}: {err}");
                    return;
                }
            };
            let app = router(app_state);
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { http_stop.cancelled().await });
            if let Err(err) = serve.await {
                tracing::error!("IPAM HTTP server exited with error: {err}");
            }
        });

        Ok(Self {
            nnc_watcher,
            pool_monitor,
            http_server,
            stop,
        })
    }

    /// Blocks until any task exits, then signals the others to stop.
    pub async fn run(mut self) {
        tokio::select! {
            _ = &mut self.nnc_watcher => info!("NodeNetworkConfig watcher exited"),
            _ = &mut self.pool_monitor => info!("pool monitor exited"),
            _ = &mut self.http_server => info!("IPAM HTTP server exited"),
        }
        self.stop.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}
