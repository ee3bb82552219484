//! Shared, mutex-guarded caches read and written by the three controllers.
//! The namespace cache is shared between the Pod and Namespace controllers;
//! the policy cache holds the authoritative "desired state" translation
//! so updates and deletes can tear down exactly what was installed.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::NetworkPolicy;
use ruleset::model::{NpmNamespace, NpmPod};
use ruleset::translate::Translation;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct NamespaceCache {
    namespaces: HashMap<String, NpmNamespace>,
}

impl NamespaceCache {
    pub fn upsert(&mut self, ns: NpmNamespace) -> Option<NpmNamespace> {
        self.namespaces.insert(ns.name.clone(), ns)
    }

    pub fn remove(&mut self, name: &str) -> Option<NpmNamespace> {
        self.namespaces.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&NpmNamespace> {
        self.namespaces.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &NpmNamespace> {
        self.namespaces.values()
    }
}

#[derive(Debug, Default)]
pub struct PodCache {
    pods: HashMap<String, NpmPod>,
}

impl PodCache {
    pub fn upsert(&mut self, pod: NpmPod) -> Option<NpmPod> {
        self.pods.insert(pod.key(), pod)
    }

    pub fn remove(&mut self, key: &str) -> Option<NpmPod> {
        self.pods.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&NpmPod> {
        self.pods.get(key)
    }
}

/// Cached admitted policy plus the translation that was actually installed,
/// so a later update/delete tears down exactly what was applied rather than
/// recomputing it in case the spec changed underneath.
#[derive(Debug, Clone)]
pub struct CachedPolicy {
    pub policy: NetworkPolicy,
    pub installed: Translation,
}

#[derive(Debug, Default)]
pub struct PolicyCache {
    policies: HashMap<String, CachedPolicy>,
}

impl PolicyCache {
    pub fn get(&self, key: &str) -> Option<&CachedPolicy> {
        self.policies.get(key)
    }

    pub fn insert(&mut self, key: String, cached: CachedPolicy) {
        self.policies.insert(key, cached);
    }

    pub fn remove(&mut self, key: &str) -> Option<CachedPolicy> {
        self.policies.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Skip updates where only the resource version changed and the spec is
    /// semantically identical.
    pub fn spec_unchanged(&self, key: &str, incoming: &NetworkPolicy) -> bool {
        self.policies
            .get(key)
            .is_some_and(|cached| cached.policy.spec == incoming.spec)
    }
}

/// Shared caches, clone cheaply via `Arc` for each controller/watcher task.
#[derive(Clone)]
pub struct SharedCaches {
    pub namespaces: Arc<Mutex<NamespaceCache>>,
    pub pods: Arc<Mutex<PodCache>>,
    pub policies: Arc<Mutex<PolicyCache>>,
}

impl Default for SharedCaches {
    fn default() -> Self {
        Self {
            namespaces: Arc::new(Mutex::new(NamespaceCache::default())),
            pods: Arc::new(Mutex::new(PodCache::default())),
            policies: Arc::new(Mutex::new(PolicyCache::default())),
        }
    }
}
