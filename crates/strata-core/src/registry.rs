//! Controller registry owned by the runtime

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::controller::DeltaController;
use crate::error::{PersistenceError, Result};
use crate::storage::DeltaStore;

/// Controllers of every agent hosted by one runtime, one per agent
pub struct ControllerRegistry<S: DeltaStore> {
    controllers: RwLock<HashMap<String, Arc<DeltaController<S>>>>,
}

impl<S: DeltaStore> Default for ControllerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DeltaStore> ControllerRegistry<S> {
    pub fn new() -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a controller for `agent`
    pub fn open(
        &self,
        agent: impl Into<String>,
        store: S,
        config: PersistenceConfig,
    ) -> Result<Arc<DeltaController<S>>> {
        let controller = Arc::new(DeltaController::new(agent, store, config));
        self.register(Arc::clone(&controller))?;
        Ok(controller)
    }

    pub fn register(&self, controller: Arc<DeltaController<S>>) -> Result<()> {
        let mut controllers = self.controllers.write();
        if controllers.contains_key(controller.agent()) {
            return Err(PersistenceError::AgentAlreadyRegistered(
                controller.agent().to_string(),
            ));
        }
        tracing::debug!(agent = controller.agent(), "Controller registered");
        controllers.insert(controller.agent().to_string(), controller);
        Ok(())
    }

    pub fn get(&self, agent: &str) -> Option<Arc<DeltaController<S>>> {
        self.controllers.read().get(agent).cloned()
    }

    pub fn remove(&self, agent: &str) -> Option<Arc<DeltaController<S>>> {
        self.controllers.write().remove(agent)
    }

    /// Registered agents, sorted
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.controllers.read().keys().cloned().collect();
        agents.sort();
        agents
    }

    pub fn len(&self) -> usize {
        self.controllers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.read().is_empty()
    }
}

impl<S: DeltaStore> std::fmt::Debug for ControllerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("agents", &self.agents())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_open_and_lookup() {
        let registry = ControllerRegistry::new();
        let ctl = registry
            .open("agent-b", MemoryStore::new(), PersistenceConfig::default())
            .unwrap();
        registry
            .open("agent-a", MemoryStore::new(), PersistenceConfig::default())
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.agents(), vec!["agent-a", "agent-b"]);
        assert!(Arc::ptr_eq(&registry.get("agent-b").unwrap(), &ctl));
        assert!(registry.get("agent-c").is_none());
    }

    #[test]
    fn test_duplicate_agent_is_rejected() {
        let registry = ControllerRegistry::new();
        registry
            .open("agent-a", MemoryStore::new(), PersistenceConfig::default())
            .unwrap();
        let err = registry
            .open("agent-a", MemoryStore::new(), PersistenceConfig::default())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::AgentAlreadyRegistered(ref a) if a == "agent-a"));
    }

    #[test]
    fn test_remove() {
        let registry = ControllerRegistry::new();
        registry
            .open("agent-a", MemoryStore::new(), PersistenceConfig::default())
            .unwrap();
        assert!(registry.remove("agent-a").is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("agent-a").is_none());
    }
}
