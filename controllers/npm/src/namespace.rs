//! Namespace controller: maintains the namespace's own address set plus its
//! membership in any namespace-selector set-list a policy has declared. On
//! update, only the namespace's label-set membership is touched.

use ruleset::engine::RulesetEngine;
use ruleset::model::{NpmNamespace, SetType};
use ruleset::runner::CommandRunner;
use tracing::info;

use crate::cache::SharedCaches;
use crate::error::ControllerError;
use crate::selector_index::SharedSelectorIndex;

pub struct NamespaceReconciler<R: CommandRunner> {
    pub engine: std::sync::Arc<RulesetEngine<R>>,
    pub caches: SharedCaches,
    pub selectors: SharedSelectorIndex,
}

impl<R: CommandRunner> NamespaceReconciler<R> {
    pub fn new(engine: std::sync::Arc<RulesetEngine<R>>, caches: SharedCaches, selectors: SharedSelectorIndex) -> Self {
        Self { engine, caches, selectors }
    }

    pub async fn apply(&self, ns: NpmNamespace) -> Result<(), ControllerError> {
        let previous_labels = {
            let caches = self.caches.namespaces.lock().await;
            caches.get(&ns.name).map(|n| n.labels.clone())
        };

        // Only the first Apply for a namespace creates its set (and takes
        // the one reference `delete()` later drops). Label-update events for
        // an already-known namespace must not re-reference a set that's
        // already present, or its ref count never returns to zero.
        if previous_labels.is_none() {
            self.engine.create_set(&ns.set_name(), SetType::IpHash).await?;
        }

        let matching_now = self.selectors.lock().await.matching(&ns.labels);
        let matching_before = match &previous_labels {
            Some(labels) => self.selectors.lock().await.matching(labels),
            None => vec![],
        };

        for list in &matching_now {
            if !matching_before.contains(list) {
                self.engine.add_to_set(list, &ns.set_name()).await?;
            }
        }
        for list in &matching_before {
            if !matching_now.contains(list) {
                self.engine.delete_from_set(list, &ns.set_name()).await?;
            }
        }

        let mut caches = self.caches.namespaces.lock().await;
        caches.upsert(ns.clone());
        info!(namespace = %ns.name, "namespace reconciled");
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        let removed = {
            let mut caches = self.caches.namespaces.lock().await;
            caches.remove(name)
        };
        let Some(ns) = removed else {
            return Ok(());
        };
        for list in self.selectors.lock().await.all_set_lists() {
            self.engine.delete_from_set(&list, &ns.set_name()).await?;
        }
        self.engine.destroy_set(&ns.set_name()).await?;
        info!(namespace = %name, "namespace removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruleset::model::DispatcherPlacement;
    use ruleset::runner::{CommandOutcome, CommandRunner};
    use std::collections::BTreeMap;

    struct NoopRunner;

    #[async_trait::async_trait]
    impl CommandRunner for NoopRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> ruleset::Result<CommandOutcome> {
            Ok(CommandOutcome::Ok { stdout: String::new() })
        }
    }

    fn engine() -> std::sync::Arc<RulesetEngine<NoopRunner>> {
        std::sync::Arc::new(RulesetEngine::new(
            NoopRunner,
            std::env::temp_dir().join(format!("npm-namespace-test-{}", std::process::id())),
            DispatcherPlacement::First,
        ))
    }

    #[tokio::test]
    async fn repeated_apply_does_not_inflate_the_sets_ref_count() {
        let reconciler = NamespaceReconciler::new(engine(), SharedCaches::default(), Default::default());
        let ns = NpmNamespace { name: "a".to_string(), labels: BTreeMap::new() };
        reconciler.apply(ns.clone()).await.unwrap();
        reconciler.apply(ns.clone()).await.unwrap();
        reconciler.apply(ns).await.unwrap();

        let remaining = reconciler.engine.destroy_set("ns-a").await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn apply_then_delete_tears_the_set_down_to_zero_refs() {
        let reconciler = NamespaceReconciler::new(engine(), SharedCaches::default(), Default::default());
        let ns = NpmNamespace { name: "b".to_string(), labels: BTreeMap::new() };
        reconciler.apply(ns).await.unwrap();
        reconciler.delete("b").await.unwrap();
        assert!(reconciler.caches.namespaces.lock().await.get("b").is_none());
    }
}
