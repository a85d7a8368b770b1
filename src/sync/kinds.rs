// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Kind catalog for one cluster connection.
//!
//! Built once from the gateway's discovery call when a session connects and
//! immutable afterwards. Lookup misses are a normal outcome (a custom kind
//! whose CRD exists but whose API surface has not registered yet): callers
//! skip or defer, they do not fail.

use std::collections::HashMap;

use crate::gateway::KindDescriptor;

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    by_key: HashMap<(String, String), KindDescriptor>,
}

impl KindRegistry {
    pub fn new(descriptors: Vec<KindDescriptor>) -> Self {
        let mut by_key = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            by_key.insert(descriptor.key(), descriptor);
        }
        Self { by_key }
    }

    /// Look up the descriptor for a (kind, api group) pair.
    pub fn resolve(&self, kind: &str, group: &str) -> Option<&KindDescriptor> {
        self.by_key.get(&(kind.to_string(), group.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// All descriptors in deterministic (group, kind) order.
    pub fn list(&self) -> Vec<&KindDescriptor> {
        let mut all: Vec<_> = self.by_key.values().collect();
        all.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: &str, group: &str, namespaced: bool) -> KindDescriptor {
        KindDescriptor {
            kind: kind.to_string(),
            group: group.to_string(),
            version: "v1".to_string(),
            plural: format!("{}s", kind.to_lowercase()),
            namespaced,
            watchable: true,
        }
    }

    #[test]
    fn resolve_finds_exact_kind_group_pair() {
        let registry = KindRegistry::new(vec![
            descriptor("Namespace", "", false),
            descriptor("Deployment", "apps", true),
            descriptor("Certificate", "cert-manager.io", true),
        ]);

        let dep = registry.resolve("Deployment", "apps").unwrap();
        assert!(dep.namespaced);
        assert_eq!(dep.api_version(), "apps/v1");

        // Same kind name in a different group is a different resource.
        assert!(registry.resolve("Deployment", "").is_none());
    }

    #[test]
    fn resolve_miss_is_none_not_an_error() {
        let registry = KindRegistry::new(vec![descriptor("Namespace", "", false)]);
        assert!(registry.resolve("Widget", "example.io").is_none());
    }

    #[test]
    fn list_is_sorted_by_group_then_kind() {
        let registry = KindRegistry::new(vec![
            descriptor("Certificate", "cert-manager.io", true),
            descriptor("Namespace", "", false),
            descriptor("Deployment", "apps", true),
            descriptor("Pod", "", true),
        ]);

        let names: Vec<String> = registry
            .list()
            .iter()
            .map(|d| format!("{}/{}", d.group, d.kind))
            .collect();
        assert_eq!(
            names,
            vec!["/Namespace", "/Pod", "apps/Deployment", "cert-manager.io/Certificate"]
        );
    }

    #[test]
    fn later_duplicate_key_wins() {
        let mut older = descriptor("Pod", "", true);
        older.version = "v1beta1".to_string();
        let registry = KindRegistry::new(vec![older, descriptor("Pod", "", true)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("Pod", "").unwrap().version, "v1");
    }
}
