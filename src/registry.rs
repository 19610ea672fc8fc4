//! The name-service abstraction replicas and sessions discover each other through.
//!
//! The service only needs three verbs (register, remove, list-by-tag), so any directory
//! (mDNS, a key/value store, a static file) can stand in. [`InMemoryRegistry`] is the in-process
//! implementation used by tests and single-machine deployments.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

/// The tag every replica registers under.
pub const REPLICA_TAG: &str = "replica";

/// Failures talking to the directory service.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// A directory of named endpoints, filterable by tag.
pub trait Registry: Send + Sync {
    /// Registers (or re-registers) `name` at `endpoint` with the given tags.
    fn register(&self, name: &str, endpoint: &str, tags: &[&str]) -> Result<(), RegistryError>;

    /// Removes `name` from the directory. Removing an unknown name is not an error.
    fn remove(&self, name: &str) -> Result<(), RegistryError>;

    /// All entries carrying `tag`, as a name-to-endpoint mapping.
    fn list(&self, tag: &str) -> Result<BTreeMap<String, String>, RegistryError>;
}

/// An in-process registry backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, (String, BTreeSet<String>)>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry::default()
    }
}

impl Registry for InMemoryRegistry {
    fn register(&self, name: &str, endpoint: &str, tags: &[&str]) -> Result<(), RegistryError> {
        let tags = tags.iter().map(|tag| tag.to_string()).collect();
        self.entries.insert(name.to_string(), (endpoint.to_string(), tags));
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), RegistryError> {
        self.entries.remove(name);
        Ok(())
    }

    fn list(&self, tag: &str) -> Result<BTreeMap<String, String>, RegistryError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.value().1.contains(tag))
            .map(|entry| (entry.key().clone(), entry.value().0.clone()))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lists_entries_by_tag() {
        let registry = InMemoryRegistry::new();
        registry.register("replica:a", "127.0.0.1:4000", &[REPLICA_TAG]).unwrap();
        registry.register("replica:b", "127.0.0.1:4001", &[REPLICA_TAG]).unwrap();
        registry.register("frontend", "127.0.0.1:5000", &[]).unwrap();

        let replicas = registry.list(REPLICA_TAG).unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas["replica:a"], "127.0.0.1:4000");
        assert!(!replicas.contains_key("frontend"));
    }

    #[test]
    fn reregistration_replaces_the_endpoint() {
        let registry = InMemoryRegistry::new();
        registry.register("replica:a", "127.0.0.1:4000", &[REPLICA_TAG]).unwrap();
        registry.register("replica:a", "127.0.0.1:9000", &[REPLICA_TAG]).unwrap();
        assert_eq!(registry.list(REPLICA_TAG).unwrap()["replica:a"], "127.0.0.1:9000");
    }

    #[test]
    fn removal_is_idempotent() {
        let registry = InMemoryRegistry::new();
        registry.register("replica:a", "127.0.0.1:4000", &[REPLICA_TAG]).unwrap();
        registry.remove("replica:a").unwrap();
        registry.remove("replica:a").unwrap();
        assert!(registry.list(REPLICA_TAG).unwrap().is_empty());
    }
}
