//! Wires the three watchers and their reconcilers together and runs them to
//! completion, mirroring the teacher's pattern of one `JoinHandle` per
//! watched resource and a single `tokio::select!` that returns as soon as
//! any of them exits.

use std::sync::Arc;

use kube::api::Api;
use kube::Client;
use ruleset::engine::RulesetEngine;
use ruleset::model::DispatcherPlacement;
use ruleset::runner::ProcessCommandRunner;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::SharedCaches;
use crate::config::Config;
use crate::error::ControllerError;
use crate::namespace::NamespaceReconciler;
use crate::pod::PodReconciler;
use crate::policy::PolicyReconciler;
use crate::selector_index::SelectorIndex;
use crate::watcher::{watch_namespaces, watch_pods, watch_policies};

pub struct Controller {
    policy_watcher: JoinHandle<()>,
    pod_watcher: JoinHandle<()>,
    namespace_watcher: JoinHandle<()>,
    dispatcher_reconciler: JoinHandle<()>,
    stop: CancellationToken,
}

impl Controller {
    pub async fn new(client: Client, config: Config) -> Result<Self, ControllerError> {
        let engine = Arc::new(RulesetEngine::new(ProcessCommandRunner, config.lock_path.clone(), config.dispatcher_placement));
        engine.init_chains().await?;

        let caches = SharedCaches::default();
        let selectors = Arc::new(tokio::sync::Mutex::new(SelectorIndex::default()));
        let stop = CancellationToken::new();

        let policy_api: Api<k8s_openapi::api::networking::v1::NetworkPolicy> = namespaced_api(&client, &config);
        let pod_api: Api<k8s_openapi::api::core::v1::Pod> = namespaced_api(&client, &config);
        let namespace_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());

        let policy_reconciler = Arc::new(PolicyReconciler::new(engine.clone(), caches.clone(), selectors.clone()));
        let pod_reconciler = Arc::new(PodReconciler::new(engine.clone(), caches.clone()));
        let namespace_reconciler = Arc::new(NamespaceReconciler::new(engine.clone(), caches.clone(), selectors.clone()));

        let policy_watcher = tokio::spawn(watch_policies(policy_api, policy_reconciler, stop.child_token()));
        let pod_watcher = tokio::spawn(watch_pods(pod_api, pod_reconciler, stop.child_token()));
        let namespace_watcher = tokio::spawn(watch_namespaces(namespace_api, namespace_reconciler, stop.child_token()));

        let placement = config.dispatcher_placement;
        let reconcile_interval = config.reconcile_interval;
        let dispatcher_stop = stop.child_token();
        let dispatcher_reconciler = tokio::spawn(async move {
            let mut ticker = interval(reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dispatcher_stop.cancelled() => return,
                    _ = ticker.tick() => {
                        ruleset::engine::reconcile_dispatcher_placement(&engine, placement).await;
                    }
                }
            }
        });

        Ok(Self {
            policy_watcher,
            pod_watcher,
            namespace_watcher,
            dispatcher_reconciler,
            stop,
        })
    }

    /// Blocks until any watcher exits, then signals the others to stop.
    pub async fn run(mut self) {
        tokio::select! {
            _ = &mut self.policy_watcher => info!("policy watcher exited"),
            _ = &mut self.pod_watcher => info!("pod watcher exited"),
            _ = &mut self.namespace_watcher => info!("namespace watcher exited"),
            _ = &mut self.dispatcher_reconciler => info!("dispatcher reconciler exited"),
        }
        self.stop.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

fn namespaced_api<K>(client: &Client, config: &Config) -> Api<K>
where
    K: kube::Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope> + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}
