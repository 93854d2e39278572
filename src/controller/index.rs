//! Reverse field index: label key → the deployments whose selector is
//! sensitive to that key (spec.md §4.1 "Reverse indexing of device events").
//! Namespace-scoped because a deployment only ever matches devices in its
//! own namespace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use kube::ResourceExt;

use crate::crd::DeviceProcessDeployment;

#[derive(Default)]
pub struct FieldIndex {
    // namespace -> label key -> deployment names in that namespace whose
    // selector is sensitive to that key.
    inner: RwLock<BTreeMap<String, BTreeMap<String, BTreeSet<String>>>>,
    // namespace/name -> the key set it was last indexed under, so `update`
    // can remove stale entries before re-inserting.
    registered: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&self, deployments: &[DeviceProcessDeployment]) {
        {
            let mut inner = self.inner.write().expect("index lock poisoned");
            inner.clear();
        }
        {
            let mut registered = self.registered.write().expect("index lock poisoned");
            registered.clear();
        }
        for deployment in deployments {
            self.update(deployment);
        }
    }

    /// Insert or refresh one deployment's entry, removing it from any key it
    /// was previously indexed under but no longer is.
    pub fn update(&self, deployment: &DeviceProcessDeployment) {
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        let full_key = format!("{namespace}/{name}");
        let new_keys = crate::selector::index_keys(&deployment.spec.selector);

        let mut inner = self.inner.write().expect("index lock poisoned");
        let mut registered = self.registered.write().expect("index lock poisoned");

        if let Some(old_keys) = registered.get(&full_key) {
            for key in old_keys {
                if !new_keys.contains(key) {
                    if let Some(by_key) = inner.get_mut(&namespace) {
                        if let Some(names) = by_key.get_mut(key) {
                            names.remove(&name);
                        }
                    }
                }
            }
        }

        let by_key = inner.entry(namespace).or_default();
        for key in &new_keys {
            by_key.entry(key.clone()).or_default().insert(name.clone());
        }
        registered.insert(full_key, new_keys);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let full_key = format!("{namespace}/{name}");
        let mut inner = self.inner.write().expect("index lock poisoned");
        let mut registered = self.registered.write().expect("index lock poisoned");
        if let Some(old_keys) = registered.remove(&full_key) {
            if let Some(by_key) = inner.get_mut(namespace) {
                for key in old_keys {
                    if let Some(names) = by_key.get_mut(&key) {
                        names.remove(name);
                    }
                }
            }
        }
    }

    /// Every `namespace/name` deployment key that is sensitive to at least
    /// one of `keys`, within `namespace`.
    pub fn lookup(&self, namespace: &str, keys: &BTreeSet<String>) -> Vec<String> {
        let inner = self.inner.read().expect("index lock poisoned");
        let Some(by_key) = inner.get(namespace) else {
            return Vec::new();
        };
        let mut matched: BTreeSet<String> = BTreeSet::new();
        for key in keys {
            if let Some(names) = by_key.get(key) {
                matched.extend(names.iter().cloned());
            }
        }
        matched.into_iter().map(|name| format!("{namespace}/{name}")).collect()
    }
}
