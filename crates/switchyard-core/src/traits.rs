use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::graph::NeutralNode;
use crate::types::{AuditEvent, NodeRunResult, RunId};

/// Blackboard: shared keyed state for one run.
///
/// Implementations serialize every mutation through a single critical
/// section, so concurrent branches never observe a torn state.
pub trait Blackboard: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    fn delete(&self, key: &str) -> Result<bool>;

    /// All keys, sorted.
    fn list_keys(&self) -> Result<Vec<String>>;

    /// Full copy of the current state.
    fn snapshot(&self) -> Result<HashMap<String, serde_json::Value>>;
}

/// Audit sink: append-only destination for audit events.
///
/// A sink may fail; callers that must not fail (the flow runner) go through
/// an emitter that logs and swallows sink errors.
pub trait AuditSink: Send + Sync + 'static {
    /// Sink name used in diagnostics.
    fn name(&self) -> &str;

    fn emit(&self, event: &AuditEvent) -> Result<()>;
}

/// Node runner: executes a single node for some framework or provider.
///
/// Implementations live outside the core. A runner receives `allow_live`
/// through the context and decides on its own whether to simulate.
/// Returning `Err` marks the node FAIL; it never stops the run.
pub trait NodeRunner: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        node: &'a NeutralNode,
        ctx: RunContext,
    ) -> BoxFuture<'a, Result<NodeRunResult>>;
}

/// Callback invoked for every event a node emits.
pub type EmitFn = Arc<dyn Fn(AuditEvent) + Send + Sync>;

/// What a node runner sees of the run it is part of.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub tenant_id: String,
    pub node_id: String,
    /// False tells the runner to simulate instead of calling providers.
    pub allow_live: bool,
    pub max_tokens_per_call: u64,
    pub cancel: CancellationToken,
    blackboard: Arc<dyn Blackboard>,
    emit: EmitFn,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        tenant_id: impl Into<String>,
        node_id: impl Into<String>,
        allow_live: bool,
        max_tokens_per_call: u64,
        cancel: CancellationToken,
        blackboard: Arc<dyn Blackboard>,
        emit: EmitFn,
    ) -> Self {
        Self {
            run_id,
            tenant_id: tenant_id.into(),
            node_id: node_id.into(),
            allow_live,
            max_tokens_per_call,
            cancel,
            blackboard,
            emit,
        }
    }

    /// Read a blackboard value.
    pub fn read(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.blackboard.get(key)
    }

    /// Read the whole blackboard.
    pub fn snapshot(&self) -> Result<HashMap<String, serde_json::Value>> {
        self.blackboard.snapshot()
    }

    /// Emit an audit event. Events without a node id are attributed to this node.
    pub fn emit(&self, mut event: AuditEvent) {
        if event.node_id.is_none() {
            event.node_id = Some(self.node_id.clone());
        }
        (self.emit)(event);
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("tenant_id", &self.tenant_id)
            .field("node_id", &self.node_id)
            .field("allow_live", &self.allow_live)
            .finish_non_exhaustive()
    }
}
