//! Wraps `kube_runtime::watcher` per watched resource, translating typed
//! events into reconciler calls. `InitApply`/`InitDone` (startup
//! reconciliation before steady-state watching begins) are logged distinctly
//! from steady-state `Apply` events. A reconcile that returns an error is
//! handed to a [`RetryQueue`] rather than dropped, so a transient failure
//! (kernel busy, ipset lock held elsewhere) is resubmitted with growing
//! back-off instead of silently never being retried.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use ruleset::runner::CommandRunner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::to_npm_namespace;
use crate::model::to_npm_pod;
use crate::namespace::NamespaceReconciler;
use crate::pod::PodReconciler;
use crate::policy::PolicyReconciler;
use crate::retry::RetryQueue;
use ruleset::model::{NpmNamespace, NpmPod};

const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(60);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(600);

enum PolicyWork {
    Apply(NetworkPolicy),
    Delete,
}

pub async fn watch_policies<R: CommandRunner>(
    api: Api<NetworkPolicy>,
    reconciler: std::sync::Arc<PolicyReconciler<R>>,
    stop: CancellationToken,
) {
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).boxed());
    let (retry_queue, mut retry_rx) = RetryQueue::new(MIN_RETRY_BACKOFF, MAX_RETRY_BACKOFF);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            next = stream.next() => {
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(policy)) => {
                        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
                        if let Err(err) = reconciler.apply(&key, &policy).await {
                            warn!(key, "policy reconcile failed, scheduling retry: {err}");
                            retry_queue.retry(key, PolicyWork::Apply(policy)).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::InitApply(policy)) => {
                        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
                        debug!(key, "startup reconciliation: applying existing policy");
                        if let Err(err) = reconciler.apply(&key, &policy).await {
                            warn!(key, "startup policy reconcile failed, scheduling retry: {err}");
                            retry_queue.retry(key, PolicyWork::Apply(policy)).await;
                        }
                    }
                    Ok(Event::Delete(policy)) => {
                        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
                        if let Err(err) = reconciler.delete(&key).await {
                            warn!(key, "policy delete failed, scheduling retry: {err}");
                            retry_queue.retry(key, PolicyWork::Delete).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::Init) => debug!("policy watcher: starting initial list"),
                    Ok(Event::InitDone) => info!("policy watcher: startup reconciliation complete"),
                    Err(err) => warn!("policy watcher error: {err}"),
                }
            }
            Some((key, work)) = retry_rx.recv() => {
                let result = match &work {
                    PolicyWork::Apply(policy) => reconciler.apply(&key, policy).await,
                    PolicyWork::Delete => reconciler.delete(&key).await,
                };
                match result {
                    Ok(()) => retry_queue.forget(&key).await,
                    Err(err) => {
                        warn!(key, "retried policy reconcile failed again, rescheduling: {err}");
                        retry_queue.retry(key, work).await;
                    }
                }
            }
        }
    }
}

enum PodWork {
    Apply(NpmPod),
    Delete,
}

pub async fn watch_pods<R: CommandRunner>(api: Api<Pod>, reconciler: std::sync::Arc<PodReconciler<R>>, stop: CancellationToken) {
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).boxed());
    let (retry_queue, mut retry_rx) = RetryQueue::new(MIN_RETRY_BACKOFF, MAX_RETRY_BACKOFF);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            next = stream.next() => {
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                        let npm_pod = to_npm_pod(&pod);
                        let key = npm_pod.key();
                        if let Err(err) = reconciler.apply(npm_pod.clone()).await {
                            warn!(key, "pod reconcile failed, scheduling retry: {err}");
                            retry_queue.retry(key, PodWork::Apply(npm_pod)).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::Delete(pod)) => {
                        let key = format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any());
                        if let Err(err) = reconciler.delete(&key).await {
                            warn!(key, "pod delete failed, scheduling retry: {err}");
                            retry_queue.retry(key, PodWork::Delete).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::Init) => debug!("pod watcher: starting initial list"),
                    Ok(Event::InitDone) => info!("pod watcher: startup reconciliation complete"),
                    Err(err) => warn!("pod watcher error: {err}"),
                }
            }
            Some((key, work)) = retry_rx.recv() => {
                let result = match &work {
                    PodWork::Apply(pod) => reconciler.apply(pod.clone()).await,
                    PodWork::Delete => reconciler.delete(&key).await,
                };
                match result {
                    Ok(()) => retry_queue.forget(&key).await,
                    Err(err) => {
                        warn!(key, "retried pod reconcile failed again, rescheduling: {err}");
                        retry_queue.retry(key, work).await;
                    }
                }
            }
        }
    }
}

enum NamespaceWork {
    Apply(NpmNamespace),
    Delete,
}

pub async fn watch_namespaces<R: CommandRunner>(
    api: Api<Namespace>,
    reconciler: std::sync::Arc<NamespaceReconciler<R>>,
    stop: CancellationToken,
) {
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).boxed());
    let (retry_queue, mut retry_rx) = RetryQueue::new(MIN_RETRY_BACKOFF, MAX_RETRY_BACKOFF);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            next = stream.next() => {
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(ns)) | Ok(Event::InitApply(ns)) => {
                        let npm_ns = to_npm_namespace(&ns);
                        let key = npm_ns.name.clone();
                        if let Err(err) = reconciler.apply(npm_ns.clone()).await {
                            warn!(key, "namespace reconcile failed, scheduling retry: {err}");
                            retry_queue.retry(key, NamespaceWork::Apply(npm_ns)).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::Delete(ns)) => {
                        let key = ns.name_any();
                        if let Err(err) = reconciler.delete(&key).await {
                            warn!(name = %key, "namespace delete failed, scheduling retry: {err}");
                            retry_queue.retry(key, NamespaceWork::Delete).await;
                        } else {
                            retry_queue.forget(&key).await;
                        }
                    }
                    Ok(Event::Init) => debug!("namespace watcher: starting initial list"),
                    Ok(Event::InitDone) => info!("namespace watcher: startup reconciliation complete"),
                    Err(err) => warn!("namespace watcher error: {err}"),
                }
            }
            Some((key, work)) = retry_rx.recv() => {
                let result = match &work {
                    NamespaceWork::Apply(ns) => reconciler.apply(ns.clone()).await,
                    NamespaceWork::Delete => reconciler.delete(&key).await,
                };
                match result {
                    Ok(()) => retry_queue.forget(&key).await,
                    Err(err) => {
                        warn!(name = %key, "retried namespace reconcile failed again, rescheduling: {err}");
                        retry_queue.retry(key, work).await;
                    }
                }
            }
        }
    }
}
