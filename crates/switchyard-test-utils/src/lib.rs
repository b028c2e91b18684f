//! Shared test utilities for Switchyard crates: scripted node runners,
//! failing sinks, and graph fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use switchyard_core::error::{FlowError, Result};
use switchyard_core::graph::{FlowDefinition, GraphEdge, NeutralNode};
use switchyard_core::traits::{AuditSink, NodeRunner, RunContext};
use switchyard_core::types::{AuditEvent, NodeRunResult};

type Script = Arc<dyn Fn(&NeutralNode, &RunContext) -> Result<NodeRunResult> + Send + Sync>;

/// Node runner driven by closures, with a per-node override table.
///
/// Records the order in which nodes were started and the peak number of
/// nodes in flight at once.
pub struct ScriptedRunner {
    default: Script,
    overrides: HashMap<String, Script>,
    delay: Option<Duration>,
    started: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new(
        script: impl Fn(&NeutralNode, &RunContext) -> Result<NodeRunResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            default: Arc::new(script),
            overrides: HashMap::new(),
            delay: None,
            started: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every node passes without side effects.
    pub fn passing() -> Self {
        Self::new(|node, _| Ok(NodeRunResult::pass(&node.id)))
    }

    /// Every node passes and writes `key = value`.
    pub fn writing(key: &str, value: serde_json::Value) -> Self {
        let key = key.to_string();
        Self::new(move |node, _| Ok(NodeRunResult::pass(&node.id).with_write(&key, value.clone())))
    }

    /// Override the behaviour for one node.
    pub fn with_node(
        mut self,
        node_id: &str,
        script: impl Fn(&NeutralNode, &RunContext) -> Result<NodeRunResult> + Send + Sync + 'static,
    ) -> Self {
        self.overrides.insert(node_id.to_string(), Arc::new(script));
        self
    }

    /// Make `node_id` return a FAIL result.
    pub fn failing_node(self, node_id: &str, reason: &str) -> Self {
        let reason = reason.to_string();
        self.with_node(node_id, move |node, _| Ok(NodeRunResult::fail(&node.id, &reason)))
    }

    /// Make `node_id` return an error instead of a result.
    pub fn erroring_node(self, node_id: &str, message: &str) -> Self {
        let message = message.to_string();
        self.with_node(node_id, move |node, _| {
            Err(FlowError::NodeExecution {
                node_id: node.id.clone(),
                message: message.clone(),
            })
        })
    }

    /// Sleep this long inside every node.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Node ids in the order they were started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Highest number of nodes that were executing at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// A handle sharing this runner's recordings, for use after the runner
    /// has been moved into a registry.
    pub fn tracker(&self) -> RunnerTracker {
        RunnerTracker {
            started: Arc::clone(&self.started),
            peak: Arc::clone(&self.peak),
        }
    }
}

impl NodeRunner for ScriptedRunner {
    fn execute<'a>(
        &'a self,
        node: &'a NeutralNode,
        ctx: RunContext,
    ) -> BoxFuture<'a, Result<NodeRunResult>> {
        Box::pin(async move {
            if let Ok(mut started) = self.started.lock() {
                started.push(node.id.clone());
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let script = self.overrides.get(&node.id).unwrap_or(&self.default);
            let result = script(node, &ctx);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

/// Read-only view of a [`ScriptedRunner`]'s recordings.
#[derive(Clone)]
pub struct RunnerTracker {
    started: Arc<Mutex<Vec<String>>>,
    peak: Arc<AtomicUsize>,
}

impl RunnerTracker {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Audit sink that always fails.
#[derive(Debug, Default)]
pub struct FailingSink;

impl AuditSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn emit(&self, _event: &AuditEvent) -> Result<()> {
        Err(FlowError::AuditSink {
            sink: "failing".into(),
            message: "sink unavailable".into(),
        })
    }
}

/// Chain `ids` as `ids[0] -> ids[1] -> ...`, entry first, exit last.
pub fn linear_flow(ids: &[&str]) -> FlowDefinition {
    let nodes = ids.iter().map(|id| NeutralNode::new(*id, id.to_uppercase())).collect();
    let edges = ids.windows(2).map(|w| GraphEdge::new(w[0], w[1])).collect();
    let exits = ids.last().map(|id| vec![id.to_string()]).unwrap_or_default();
    FlowDefinition::new(nodes, edges, ids.first().copied().unwrap_or_default())
        .with_id("linear")
        .with_exits(exits)
}

/// Install a test tracing subscriber (`RUST_LOG` or `switchyard=debug`).
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("switchyard=debug")),
        )
        .with_test_writer()
        .try_init();
}
