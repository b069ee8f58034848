// SPDX-License-Identifier: Apache-2.0

//! Connector Registry
//!
//! Maps connector binding names to the connector serving them.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::Connector;

pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Registers a connector under its `binding_name()`, replacing any
    /// previous connector for that binding.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let binding = connector.binding_name().to_string();
        self.connectors.insert(binding, connector);
    }

    pub fn get(&self, binding: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(binding).cloned()
    }

    /// Registered binding names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut bindings: Vec<&str> = self.connectors.keys().map(|s| s.as_str()).collect();
        bindings.sort_unstable();
        bindings
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::MemoryConnector;

    #[test]
    fn registers_by_binding_name() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(MemoryConnector::new("pg")));
        registry.register(Arc::new(MemoryConnector::new("mongo")));
        registry.register(Arc::new(MemoryConnector::new("pg")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list(), vec!["mongo", "pg"]);
        assert!(registry.get("pg").is_some());
        assert!(registry.get("oracle").is_none());
    }
}
