//! Pod controller: contributes each usable pod's IP to the namespace set,
//! one set per label key, one set per label key=value pair, and one set per
//! named container port. On label change only the sets that actually
//! changed are touched; on IP change the pod is re-added under the new IP.
//!
//! Pods without an IP, host-networked pods, and pods that are terminal or
//! already past their deletion grace period are treated as absent —
//! proactive cleanup in case a delete event is lost.

use std::collections::BTreeMap;

use ruleset::engine::RulesetEngine;
use ruleset::model::{NpmPod, SetType};
use ruleset::runner::CommandRunner;
use ruleset::translate::{label_key_set_name, named_port_set_name, pod_selector_set_name};
use tracing::info;

use crate::cache::SharedCaches;
use crate::error::ControllerError;

pub struct PodReconciler<R: CommandRunner> {
    pub engine: std::sync::Arc<RulesetEngine<R>>,
    pub caches: SharedCaches,
}

impl<R: CommandRunner> PodReconciler<R> {
    pub fn new(engine: std::sync::Arc<RulesetEngine<R>>, caches: SharedCaches) -> Self {
        Self { engine, caches }
    }

    pub async fn apply(&self, pod: NpmPod) -> Result<(), ControllerError> {
        let key = pod.key();
        if !pod.is_usable() {
            return self.delete(&key).await;
        }

        let previous = {
            let caches = self.caches.pods.lock().await;
            caches.get(&key).cloned()
        };

        if let Some(prev) = &previous {
            if prev.ip != pod.ip {
                self.remove_membership(prev).await?;
            } else {
                self.diff_labels(prev, &pod).await?;
            }
        }

        if previous.as_ref().is_none_or(|p| p.ip != pod.ip) {
            self.add_membership(&pod).await?;
        }

        let mut caches = self.caches.pods.lock().await;
        caches.upsert(pod);
        info!(key, "pod reconciled");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), ControllerError> {
        let removed = {
            let mut caches = self.caches.pods.lock().await;
            caches.remove(key)
        };
        let Some(pod) = removed else {
            return Ok(());
        };
        self.remove_membership(&pod).await?;
        info!(key, "pod removed");
        Ok(())
    }

    async fn add_membership(&self, pod: &NpmPod) -> Result<(), ControllerError> {
        let Some(ip) = &pod.ip else { return Ok(()) };
        let ns_set = format!("ns-{}", pod.namespace);
        self.engine.create_set(&ns_set, SetType::IpHash).await?;
        self.engine.add_to_set(&ns_set, ip).await?;

        for (key, set_name) in label_sets(&pod.namespace, &pod.labels) {
            self.engine.create_set(&set_name, SetType::IpHash).await?;
            self.engine.add_to_set(&set_name, ip).await?;
            let _ = key;
        }

        for port in &pod.container_ports {
            if let Some(name) = &port.name {
                let set_name = named_port_set_name(name);
                self.engine.create_set(&set_name, SetType::IpPortHash).await?;
                self.engine
                    .add_to_set(&set_name, &format!("{ip},{}:{}", port.protocol.as_str(), port.port))
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_membership(&self, pod: &NpmPod) -> Result<(), ControllerError> {
        let Some(ip) = &pod.ip else { return Ok(()) };
        let ns_set = format!("ns-{}", pod.namespace);
        self.engine.delete_from_set(&ns_set, ip).await?;
        self.engine.destroy_set(&ns_set).await?;

        for (_, set_name) in label_sets(&pod.namespace, &pod.labels) {
            self.engine.delete_from_set(&set_name, ip).await?;
            self.engine.destroy_set(&set_name).await?;
        }

        for port in &pod.container_ports {
            if let Some(name) = &port.name {
                let set_name = named_port_set_name(name);
                self.engine
                    .delete_from_set(&set_name, &format!("{ip},{}:{}", port.protocol.as_str(), port.port))
                    .await?;
                self.engine.destroy_set(&set_name).await?;
            }
        }
        Ok(())
    }

    /// Only touches the sets whose membership actually changed between the
    /// old and new label maps.
    async fn diff_labels(&self, prev: &NpmPod, next: &NpmPod) -> Result<(), ControllerError> {
        let Some(ip) = &next.ip else { return Ok(()) };
        let before = label_sets(&prev.namespace, &prev.labels);
        let after = label_sets(&next.namespace, &next.labels);

        for (_, set_name) in &before {
            if !after.iter().any(|(_, n)| n == set_name) {
                self.engine.delete_from_set(set_name, ip).await?;
                self.engine.destroy_set(set_name).await?;
            }
        }
        for (_, set_name) in &after {
            if !before.iter().any(|(_, n)| n == set_name) {
                self.engine.create_set(set_name, SetType::IpHash).await?;
                self.engine.add_to_set(set_name, ip).await?;
            }
        }
        Ok(())
    }
}

/// Every set name a pod's labels contribute membership to: one per key, one
/// per key=value pair.
fn label_sets(namespace: &str, labels: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut sets = Vec::with_capacity(labels.len() * 2);
    for (k, v) in labels {
        sets.push((k.clone(), label_key_set_name(namespace, k)));
        let mut pair = BTreeMap::new();
        pair.insert(k.clone(), v.clone());
        sets.push((format!("{k}={v}"), pod_selector_set_name(namespace, &Some(pair))));
    }
    sets
}
