//! Flow graph model: nodes, edges, and the flow definition that binds them.
//!
//! These types are authored once (usually deserialized from JSON) and are
//! never mutated by the runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::ArtifactSpec;

/// Canvas position of a node in the authoring UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node in the flow graph.
///
/// A node is a unit of work bound (optionally) to an external capability
/// through its `runner` key. Input/output ports name the blackboard keys it
/// reads and writes, which the runner uses to decide which branches may run
/// concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeutralNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position: Position,
    /// Capability components mounted on this node (tools, memories, agents).
    #[serde(default)]
    pub components: Vec<String>,
    /// Blackboard keys this node reads.
    #[serde(default)]
    pub input_ports: Vec<String>,
    /// Blackboard keys this node writes.
    #[serde(default)]
    pub output_ports: Vec<String>,
    /// Registry key of the node runner (framework binding). `None` selects
    /// the registry default.
    #[serde(default)]
    pub runner: Option<String>,
    /// Provider this node calls, used for allow-lists and the connectivity ledger.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Tokens the node requests per call.
    #[serde(default)]
    pub requested_tokens: Option<u64>,
    /// Artifacts this node may produce.
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Free-form parameters handed to the node runner.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl NeutralNode {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position: Position::default(),
            components: Vec::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            runner: None,
            provider: None,
            model: None,
            requested_tokens: None,
            artifacts: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_inputs(mut self, ports: Vec<String>) -> Self {
        self.input_ports = ports;
        self
    }

    pub fn with_outputs(mut self, ports: Vec<String>) -> Self {
        self.output_ports = ports;
        self
    }

    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.components = components;
        self
    }

    pub fn with_runner(mut self, key: impl Into<String>) -> Self {
        self.runner = Some(key.into());
        self
    }

    /// Bind the node to a provider and model.
    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_requested_tokens(mut self, tokens: u64) -> Self {
        self.requested_tokens = Some(tokens);
        self
    }

    pub fn with_artifact(mut self, spec: ArtifactSpec) -> Self {
        self.artifacts.push(spec);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Condition that must hold for the target to be activated by this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Traverse whenever the source node ran.
    #[default]
    Always,
    /// Traverse only if the source node passed.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if a simple expression matches the blackboard.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl GraphEdge {
    /// Create an unconditional edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
            condition: EdgeCondition::Always,
        }
    }

    pub fn on_success(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::OnSuccess,
            ..Self::new(source, target)
        }
    }

    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::OnFailure,
            ..Self::new(source, target)
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            condition: EdgeCondition::Conditional { expr: expr.into() },
            ..Self::new(source, target)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A complete workflow: nodes, edges, entry and exits, and the blackboard
/// defaults a run starts from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: String,
    pub nodes: Vec<NeutralNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    pub entry: String,
    #[serde(default)]
    pub exits: Vec<String>,
    /// Blackboard keys and their default values.
    #[serde(default)]
    pub blackboard_schema: HashMap<String, serde_json::Value>,
}

impl FlowDefinition {
    pub fn new(nodes: Vec<NeutralNode>, edges: Vec<GraphEdge>, entry: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            nodes,
            edges,
            entry: entry.into(),
            exits: Vec::new(),
            blackboard_schema: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_exits(mut self, exits: Vec<String>) -> Self {
        self.exits = exits;
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.blackboard_schema.insert(key.into(), value);
        self
    }

    pub fn node(&self, id: &str) -> Option<&NeutralNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Parse a flow definition from JSON text.
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Evaluate a simple conditional expression against blackboard data.
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, data: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    // The key comes first, so the leftmost operator is the real one; anything
    // after it belongs to the literal.
    let Some((op, at)) = [" contains ", "!=", "=="]
        .into_iter()
        .filter_map(|op| expr.find(op).map(|at| (op, at)))
        .min_by_key(|&(_, at)| at)
    else {
        return false;
    };

    let key = expr[..at].trim();
    if key.is_empty() || key.contains('"') {
        return false;
    }
    let literal = expr[at + op.len()..].trim().trim_matches('"');
    let Some(value) = data.get(key) else {
        return false;
    };

    match op {
        " contains " => value.as_str().is_some_and(|s| s.contains(literal)),
        "!=" => !value_matches(value, literal),
        _ => value_matches(value, literal),
    }
}

/// Compare a blackboard value with an expression literal. Strings compare by
/// content, everything else by its JSON rendering (`true`, `3`, ...).
fn value_matches(value: &serde_json::Value, literal: &str) -> bool {
    match value {
        serde_json::Value::String(s) => s == literal,
        other => other.to_string() == literal,
    }
}
