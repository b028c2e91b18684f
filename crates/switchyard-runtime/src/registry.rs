use std::collections::HashMap;
use std::sync::Arc;

use switchyard_core::error::{FlowError, Result};
use switchyard_core::graph::{FlowDefinition, NeutralNode};
use switchyard_core::traits::NodeRunner;

/// Registry of node runners keyed by framework/provider name.
#[derive(Default)]
pub struct NodeRunnerRegistry {
    runners: HashMap<String, Arc<dyn NodeRunner>>,
    default_key: Option<String>,
}

impl NodeRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under `key`, replacing any previous one.
    pub fn register(&mut self, key: impl Into<String>, runner: impl NodeRunner) {
        self.runners.insert(key.into(), Arc::new(runner));
    }

    pub fn register_arc(&mut self, key: impl Into<String>, runner: Arc<dyn NodeRunner>) {
        self.runners.insert(key.into(), runner);
    }

    /// Unregister a runner by key.
    pub fn unregister(&mut self, key: &str) -> bool {
        self.runners.remove(key).is_some()
    }

    /// Runner used by nodes that do not name one.
    pub fn set_default(&mut self, key: impl Into<String>) {
        self.default_key = Some(key.into());
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn NodeRunner>> {
        self.runners.get(key).cloned()
    }

    /// Registered keys, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.runners.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// The runner responsible for `node`.
    pub fn resolve(&self, node: &NeutralNode) -> Result<Arc<dyn NodeRunner>> {
        let key = node
            .runner
            .as_deref()
            .or(self.default_key.as_deref())
            .ok_or_else(|| FlowError::UnknownRunner {
                key: "<default>".to_string(),
                node_id: node.id.clone(),
            })?;
        self.get(key).ok_or_else(|| FlowError::UnknownRunner {
            key: key.to_string(),
            node_id: node.id.clone(),
        })
    }

    /// Fail fast if any node of `flow` has no runner.
    pub fn validate(&self, flow: &FlowDefinition) -> Result<()> {
        for node in &flow.nodes {
            self.resolve(node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::graph::FlowDefinition;
    use switchyard_test_utils::ScriptedRunner;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = NodeRunnerRegistry::new();
        registry.register("crewai", ScriptedRunner::passing());
        registry.register("langgraph", ScriptedRunner::passing());
        assert_eq!(registry.list(), vec!["crewai", "langgraph"]);

        let node = NeutralNode::new("a", "A").with_runner("crewai");
        assert!(registry.resolve(&node).is_ok());

        assert!(registry.unregister("crewai"));
        assert!(matches!(
            registry.resolve(&node),
            Err(FlowError::UnknownRunner { ref key, .. }) if key == "crewai"
        ));
    }

    #[test]
    fn test_default_runner() {
        let mut registry = NodeRunnerRegistry::new();
        registry.register("sim", ScriptedRunner::passing());
        let node = NeutralNode::new("a", "A");
        assert!(registry.resolve(&node).is_err());

        registry.set_default("sim");
        assert!(registry.resolve(&node).is_ok());
    }

    #[test]
    fn test_validate_flow() {
        let mut registry = NodeRunnerRegistry::new();
        registry.register("autogen", ScriptedRunner::passing());
        let flow = FlowDefinition::new(
            vec![
                NeutralNode::new("a", "A").with_runner("autogen"),
                NeutralNode::new("b", "B").with_runner("vertex"),
            ],
            vec![],
            "a",
        );
        assert!(matches!(
            registry.validate(&flow),
            Err(FlowError::UnknownRunner { ref node_id, .. }) if node_id == "b"
        ));
    }
}
