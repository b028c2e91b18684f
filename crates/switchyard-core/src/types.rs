use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Usage a node runner reports back, accumulated into the run's budget counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    /// Provider calls made by the node.
    #[serde(default)]
    pub calls: u32,
    #[serde(default)]
    pub tokens: u64,
    /// Whether the calls were live (as opposed to simulated).
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Connectivity mode the provider was reached through (e.g. "sdk", "rest").
    #[serde(default)]
    pub mode_id: Option<String>,
}

/// Outcome of running one node. Produced once and appended to the run's
/// result list; never altered afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunResult {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Artifacts persisted for this node.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Blackboard writes to apply, in key order.
    #[serde(default)]
    pub writes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<AuditEvent>,
    #[serde(default)]
    pub error: Option<String>,
    /// Artifact content keyed by artifact spec id.
    #[serde(default)]
    pub content: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub usage: NodeUsage,
}

impl NodeRunResult {
    fn with_status(node_id: impl Into<String>, status: NodeStatus, reason: String) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            status,
            reason,
            started_at: now,
            finished_at: now,
            artifacts: Vec::new(),
            writes: BTreeMap::new(),
            events: Vec::new(),
            error: None,
            content: HashMap::new(),
            usage: NodeUsage::default(),
        }
    }

    pub fn pass(node_id: impl Into<String>) -> Self {
        Self::with_status(node_id, NodeStatus::Pass, String::new())
    }

    pub fn fail(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_status(node_id, NodeStatus::Fail, reason.into())
    }

    pub fn skip(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_status(node_id, NodeStatus::Skip, reason.into())
    }

    pub fn with_write(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.writes.insert(key.into(), value);
        self
    }

    /// Attach content for a declared artifact spec.
    pub fn with_content(mut self, spec_id: impl Into<String>, value: serde_json::Value) -> Self {
        self.content.insert(spec_id.into(), value);
        self
    }

    pub fn with_usage(mut self, usage: NodeUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_event(mut self, event: AuditEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Immutable record of a state transition during a run.
///
/// Serialized as one line of the audit log:
/// `{timestamp, event_type, node_id, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            node_id: None,
            payload,
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Declared kind of an artifact; decides the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Markdown,
    Json,
    Code,
    #[serde(other)]
    Text,
}

/// An artifact a node may produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub id: String,
    pub kind: ArtifactKind,
    /// Source language for `code` artifacts.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ArtifactSpec {
    pub fn new(id: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            id: id.into(),
            kind,
            language: None,
            metadata: HashMap::new(),
        }
    }

    pub fn code(id: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..Self::new(id, ArtifactKind::Code)
        }
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub mime_type: String,
    pub location: PathBuf,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Run-level state machine: Initialized → Running → {Completed, Aborted, Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Initialized,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunOutcome {
    /// Completed and no node failed.
    Pass,
    /// Completed with at least one failed node.
    Fail,
    /// Aborted or cancelled before every node was considered.
    Incomplete,
}

/// Result of `FlowRunner::run`. Always produced, whatever the run's fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub flow_id: String,
    pub tenant_id: String,
    pub state: RunState,
    pub outcome: RunOutcome,
    /// Per-node results in execution order.
    pub results: Vec<NodeRunResult>,
    #[serde(default)]
    pub abort_reason: Option<String>,
    /// Blackboard contents when the run ended.
    #[serde(default)]
    pub blackboard: HashMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn result(&self, node_id: &str) -> Option<&NodeRunResult> {
        self.results.iter().find(|r| r.node_id == node_id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.node_id.as_str()).collect()
    }
}
