//! Registry of executor capabilities, keyed by `agent_or_tool`

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::coord::capability::Capability;

#[derive(Clone)]
pub struct CapabilityRegistry {
    capabilities: Arc<RwLock<HashMap<String, Arc<dyn Capability>>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a capability under its own name, replacing any previous one
    pub fn register(&self, capability: Arc<dyn Capability>) {
        let mut capabilities = self.capabilities.write();
        capabilities.insert(capability.name().to_string(), capability);
    }

    /// Register under an explicit alias
    pub fn register_as(&self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        self.capabilities.write().insert(name.into(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
