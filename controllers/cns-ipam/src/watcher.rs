//! Watches the per-node `NodeNetworkConfig`, filtered by name to just this
//! node's resource (spec §4.6 "filtered to only this node"). A reconcile
//! that fails is handed to a [`RetryQueue`] rather than dropped, since
//! `reconcile()` re-fetches the NNC by name and needs no event payload to
//! retry.

use std::time::Duration;

use crds::NodeNetworkConfig;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::nnc::NncReconciler;
use crate::retry::RetryQueue;

const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(60);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(600);

pub async fn watch_nnc(api: Api<NodeNetworkConfig>, node_name: String, reconciler: std::sync::Arc<NncReconciler>, stop: CancellationToken) {
    let watcher_config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));
    let mut stream = Box::pin(watcher::watcher(api, watcher_config).boxed());
    let (retry_queue, mut retry_rx) = RetryQueue::new(MIN_RETRY_BACKOFF, MAX_RETRY_BACKOFF);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            next = stream.next() => {
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(nnc)) | Ok(Event::InitApply(nnc)) => {
                        let name = nnc.name_any();
                        if let Err(err) = reconciler.reconcile(&name).await {
                            warn!(name, "NodeNetworkConfig reconcile failed, scheduling retry: {err}");
                            retry_queue.retry(name, ()).await;
                        } else {
                            retry_queue.forget(&name).await;
                        }
                    }
                    Ok(Event::Delete(nnc)) => {
                        reconciler.handle_delete(&nnc.name_any()).await;
                    }
                    Ok(Event::Init) => debug!("NodeNetworkConfig watcher: starting initial list"),
                    Ok(Event::InitDone) => info!("NodeNetworkConfig watcher: startup reconciliation complete"),
                    Err(err) => warn!("NodeNetworkConfig watcher error: {err}"),
                }
            }
            Some((name, ())) = retry_rx.recv() => {
                match reconciler.reconcile(&name).await {
                    Ok(()) => retry_queue.forget(&name).await,
                    Err(err) => {
                        warn!(name, "retried NodeNetworkConfig reconcile failed again, rescheduling: {err}");
                        retry_queue.retry(name, ()).await;
                    }
                }
            }
        }
    }
}
