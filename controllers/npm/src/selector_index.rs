//! Tracks which namespace-selector set-lists are currently declared by some
//! installed policy, so the Namespace controller can maintain membership as
//! labels change without re-deriving the predicate from a hashed set name.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use ruleset::translate::Translation;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct SelectorIndex {
    /// set-list name -> label predicate (`None` means "all namespaces").
    entries: HashMap<String, Option<BTreeMap<String, String>>>,
    /// reference counts so tearing down one policy doesn't drop a selector
    /// another policy still depends on.
    refcounts: HashMap<String, u32>,
}

impl SelectorIndex {
    /// Registers a translation's set-list declarations against the index.
    /// Returns the names of set-lists whose reference count went from zero
    /// to one — these are newly declared by this reconcile, and the caller
    /// must backfill membership for namespaces reconciled before this
    /// policy existed (the translator always emits a fresh set-list with
    /// `members: vec![]`, so nothing else populates it).
    pub fn register(&mut self, translation: &Translation) -> Vec<String> {
        let mut newly_created = Vec::new();
        for decl in &translation.set_lists {
            self.entries.entry(decl.name.clone()).or_insert_with(|| decl.selector.clone());
            let count = self.refcounts.entry(decl.name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                newly_created.push(decl.name.clone());
            }
        }
        newly_created
    }

    pub fn unregister(&mut self, translation: &Translation) {
        for decl in &translation.set_lists {
            if let Some(count) = self.refcounts.get_mut(&decl.name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.refcounts.remove(&decl.name);
                    self.entries.remove(&decl.name);
                }
            }
        }
    }

    pub fn matching(&self, labels: &BTreeMap<String, String>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, selector)| Self::selector_matches(selector, labels))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn all_set_lists(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// True if `labels` satisfies `selector` (`None` matches every namespace).
    pub fn selector_matches(selector: &Option<BTreeMap<String, String>>, labels: &BTreeMap<String, String>) -> bool {
        match selector {
            None => true,
            Some(predicate) => predicate.iter().all(|(k, v)| labels.get(k) == Some(v)),
        }
    }
}

pub type SharedSelectorIndex = Arc<Mutex<SelectorIndex>>;
