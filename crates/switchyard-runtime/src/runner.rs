use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, error, info, warn};

use switchyard_core::cancel::CancellationToken;
use switchyard_core::config::RuntimeConfig;
use switchyard_core::error::{FlowError, Result};
use switchyard_core::graph::{evaluate_condition, EdgeCondition, FlowDefinition, NeutralNode};
use switchyard_core::policy::{
    BudgetCounters, PolicySubject, PolicyViolation, Severity, TenantContext,
};
use switchyard_core::traits::{AuditSink, Blackboard, EmitFn, RunContext};
use switchyard_core::types::{
    AuditEvent, NodeRunResult, NodeStatus, RunId, RunOutcome, RunState, RunSummary,
};

use crate::artifacts::ArtifactWriter;
use crate::audit::{AuditEmitter, CompositeSink, ConsoleSink, JsonlSink};
use crate::blackboard::{MemoryBlackboard, PersistedBlackboard};
use crate::ledger::ConnectivityLedger;
use crate::policy::{first_failure, TenantPolicyEngine};
use crate::registry::NodeRunnerRegistry;
use crate::validator::{reachable_from, GraphValidator};

const REASON_CANCELLED: &str = "cancelled before start";
const REASON_UNREACHABLE: &str = "unreachable from entry";
const REASON_NOT_TAKEN: &str = "not reached: no incoming edge taken";

/// Orchestrates one flow run at a time over a validated graph.
///
/// Nodes run in topological order. A node FAIL does not stop the run;
/// a budget or FAIL-severity policy breach aborts it, and cancellation
/// skips everything not yet started.
pub struct FlowRunner {
    registry: Arc<NodeRunnerRegistry>,
    policy: Arc<TenantPolicyEngine>,
    /// Durable blackboard shared by every run. When unset, each run gets a
    /// fresh in-memory blackboard of its own.
    shared_blackboard: Option<Arc<dyn Blackboard>>,
    audit: AuditEmitter,
    artifacts: Option<ArtifactWriter>,
    ledger: Arc<ConnectivityLedger>,
    cancel: CancellationToken,
    parallel_branches: bool,
}

/// Mutable bookkeeping of a run in progress.
struct RunProgress {
    run_id: RunId,
    state: RunState,
    blackboard: Arc<dyn Blackboard>,
    started: Instant,
    counters: BudgetCounters,
    statuses: HashMap<String, NodeStatus>,
    results: Vec<NodeRunResult>,
}

impl RunProgress {
    fn transition(&mut self, to: RunState) {
        if self.state.is_terminal() {
            warn!(run_id = %self.run_id, from = %self.state, to = %to, "Ignoring transition out of a terminal run state");
            return;
        }
        debug!(run_id = %self.run_id, from = %self.state, to = %to, "Run state transition");
        self.state = to;
    }
}

impl FlowRunner {
    /// Create a runner with per-run in-memory blackboards, an in-memory ledger
    /// and no audit sinks.
    pub fn new(registry: NodeRunnerRegistry, policy: TenantPolicyEngine) -> Self {
        Self {
            registry: Arc::new(registry),
            policy: Arc::new(policy),
            shared_blackboard: None,
            audit: AuditEmitter::null(),
            artifacts: None,
            ledger: Arc::new(ConnectivityLedger::in_memory()),
            cancel: CancellationToken::new(),
            parallel_branches: false,
        }
    }

    /// Build a runner from config. The ledger is passed in because it is
    /// shared by every run in the process.
    pub fn from_config(
        config: &RuntimeConfig,
        mut registry: NodeRunnerRegistry,
        ledger: Arc<ConnectivityLedger>,
    ) -> Result<Self> {
        if let Some(ref key) = config.runtime.default_runner {
            registry.set_default(key.clone());
        }
        let policy = TenantPolicyEngine::from_config(config)?;

        let mut sinks = CompositeSink::new();
        if config.runtime.console_audit {
            sinks.push(Arc::new(ConsoleSink::new()));
        }
        if let Some(path) = config.audit_log_path() {
            sinks.push(Arc::new(JsonlSink::new(path)?));
        }

        let mut runner = Self::new(registry, policy)
            .with_ledger(ledger)
            .with_parallel_branches(config.runtime.parallel_branches);
        if let Some(path) = config.blackboard_path() {
            runner = runner.with_blackboard(Arc::new(PersistedBlackboard::open(path)?));
        }
        if !sinks.is_empty() {
            runner = runner.with_audit_sink(Arc::new(sinks));
        }
        if let Some(dir) = config.artifacts_dir() {
            runner = runner.with_artifacts(ArtifactWriter::new(dir));
        }
        Ok(runner)
    }

    /// Share `blackboard` across runs instead of giving each run its own.
    pub fn with_blackboard(mut self, blackboard: Arc<dyn Blackboard>) -> Self {
        self.shared_blackboard = Some(blackboard);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = AuditEmitter::new(sink);
        self
    }

    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<ConnectivityLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_parallel_branches(mut self, enabled: bool) -> Self {
        self.parallel_branches = enabled;
        self
    }

    /// The token that cancels this runner's runs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shared_blackboard(&self) -> Option<Arc<dyn Blackboard>> {
        self.shared_blackboard.clone()
    }

    pub fn ledger(&self) -> Arc<ConnectivityLedger> {
        Arc::clone(&self.ledger)
    }

    /// Run `flow` for `tenant_id`, seeding the blackboard with `inputs`.
    ///
    /// Always returns a summary holding whatever results were produced.
    pub async fn run(
        &self,
        flow: &FlowDefinition,
        tenant_id: &str,
        inputs: HashMap<String, serde_json::Value>,
    ) -> RunSummary {
        let blackboard = match self.shared_blackboard {
            Some(ref shared) => Arc::clone(shared),
            None => Arc::new(MemoryBlackboard::new()) as Arc<dyn Blackboard>,
        };
        let mut progress = RunProgress {
            run_id: RunId::new(),
            state: RunState::Initialized,
            blackboard,
            started: Instant::now(),
            counters: BudgetCounters::default(),
            statuses: HashMap::new(),
            results: Vec::new(),
        };
        let started_at = Utc::now();
        let summary = |mut progress: RunProgress, state: RunState, abort_reason: Option<String>| {
            progress.transition(state);
            let blackboard = progress.blackboard.snapshot().unwrap_or_else(|e| {
                warn!(run_id = %progress.run_id, error = %e, "Blackboard snapshot failed");
                HashMap::new()
            });
            let outcome = match progress.state {
                RunState::Completed
                    if progress.results.iter().any(|r| r.status == NodeStatus::Fail) =>
                {
                    RunOutcome::Fail
                }
                RunState::Completed => RunOutcome::Pass,
                _ => RunOutcome::Incomplete,
            };
            RunSummary {
                run_id: progress.run_id,
                flow_id: flow.id.clone(),
                tenant_id: tenant_id.to_string(),
                state: progress.state,
                outcome,
                results: progress.results,
                abort_reason,
                blackboard,
                started_at,
                finished_at: Utc::now(),
            }
        };

        let order = match GraphValidator::validate_flow(flow)
            .and_then(|order| self.registry.validate(flow).map(|_| order))
        {
            Ok(order) => order,
            Err(e) => {
                let reason = self.abort(&progress, None, &e);
                return summary(progress, RunState::Aborted, Some(reason));
            }
        };

        let tenant = match self.policy.resolve(tenant_id) {
            Ok(t) => t,
            Err(e) => {
                let reason = self.abort(&progress, None, &e);
                return summary(progress, RunState::Aborted, Some(reason));
            }
        };

        progress.transition(RunState::Running);
        info!(
            run_id = %progress.run_id,
            flow = %flow.id,
            tenant = tenant_id,
            nodes = order.len(),
            allow_live = tenant.allow_live,
            "Flow run started"
        );
        self.audit.emit(AuditEvent::new(
            "run_started",
            json!({
                "run_id": progress.run_id.0,
                "flow_id": flow.id,
                "tenant_id": tenant_id,
                "allow_live": tenant.allow_live,
                "node_count": order.len(),
            }),
        ));

        if let Err(e) = seed_blackboard(progress.blackboard.as_ref(), flow, inputs) {
            let reason = self.abort(&progress, None, &e);
            return summary(progress, RunState::Aborted, Some(reason));
        }

        let run_subject = PolicySubject {
            live: tenant.allow_live,
            ..Default::default()
        };
        let violations = self.policy.evaluate_policies(&tenant, &run_subject);
        if let Some(v) = first_failure(&violations) {
            let reason = self.abort(&progress, None, &violation_error(v));
            return summary(progress, RunState::Aborted, Some(reason));
        }
        self.emit_warnings(&violations);

        let reachable = reachable_from(&flow.edges, &flow.entry);
        let mut i = 0;
        while i < order.len() {
            if self.cancel.is_cancelled() {
                self.cancel_remaining(&mut progress, &order[i..]);
                return summary(progress, RunState::Cancelled, None);
            }

            let node = order[i];
            if let Some(reason) = self.skip_reason(flow, node, &reachable, &progress) {
                self.record_skip(&mut progress, node, reason);
                i += 1;
                continue;
            }

            let warnings = match self.gate(&tenant, node, &progress, 0, 0) {
                Ok(w) => w,
                Err(e) => {
                    let reason = self.abort(&progress, Some(node.id.as_str()), &e);
                    return summary(progress, RunState::Aborted, Some(reason));
                }
            };

            let mut batch = vec![(node, warnings)];
            if self.parallel_branches {
                self.extend_batch(flow, &order, i + 1, &tenant, &reachable, &progress, &mut batch);
            }
            i += batch.len();

            for (_, warnings) in &batch {
                self.emit_warnings(warnings);
            }

            if batch.len() > 1 {
                debug!(
                    nodes = ?batch.iter().map(|(n, _)| n.id.as_str()).collect::<Vec<_>>(),
                    "Dispatching independent branches concurrently"
                );
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|(node, _)| self.execute_node(node, &tenant, &progress)),
            )
            .await;

            for ((node, _), result) in batch.iter().zip(results) {
                self.finish_node(&mut progress, node, result);
            }
        }

        let failed = progress
            .results
            .iter()
            .filter(|r| r.status == NodeStatus::Fail)
            .count();
        info!(
            run_id = %progress.run_id,
            failed,
            elapsed_ms = progress.started.elapsed().as_millis() as u64,
            "Flow run completed"
        );
        self.audit.emit(AuditEvent::new(
            "run_completed",
            json!({
                "run_id": progress.run_id.0,
                "outcome": if failed > 0 { "FAIL" } else { "PASS" },
                "passed": progress.results.iter().filter(|r| r.status == NodeStatus::Pass).count(),
                "failed": failed,
                "skipped": progress.results.iter().filter(|r| r.status == NodeStatus::Skip).count(),
                "calls": progress.counters.calls_made,
                "duration_ms": progress.started.elapsed().as_millis() as u64,
            }),
        ));
        summary(progress, RunState::Completed, None)
    }

    /// Why `node` must be skipped, if it must.
    ///
    /// The entry always runs. Any other node runs only when at least one
    /// incoming edge is taken: its source ran (PASS or FAIL) and its
    /// condition holds.
    fn skip_reason(
        &self,
        flow: &FlowDefinition,
        node: &NeutralNode,
        reachable: &HashSet<String>,
        progress: &RunProgress,
    ) -> Option<&'static str> {
        if node.id == flow.entry {
            return None;
        }
        if !reachable.contains(&node.id) {
            return Some(REASON_UNREACHABLE);
        }

        let mut snapshot = None;
        let taken = flow
            .edges
            .iter()
            .filter(|e| e.target == node.id)
            .any(|edge| {
                let source = match progress.statuses.get(&edge.source).copied() {
                    Some(status) if status != NodeStatus::Skip => status,
                    _ => return false,
                };
                match &edge.condition {
                    EdgeCondition::Always => true,
                    EdgeCondition::OnSuccess => source == NodeStatus::Pass,
                    EdgeCondition::OnFailure => source == NodeStatus::Fail,
                    EdgeCondition::Conditional { expr } => {
                        let data = snapshot.get_or_insert_with(|| {
                            progress.blackboard.snapshot().unwrap_or_else(|e| {
                                warn!(error = %e, "Blackboard snapshot failed, condition is false");
                                HashMap::new()
                            })
                        });
                        evaluate_condition(expr, data)
                    }
                }
            });

        if taken {
            None
        } else {
            Some(REASON_NOT_TAKEN)
        }
    }

    /// Budget and policy check before dispatching `node`.
    ///
    /// `pending_nodes` and `pending_calls` account for batch members admitted
    /// but not yet finished. Returns the WARN violations to record once the
    /// node is dispatched.
    fn gate(
        &self,
        tenant: &TenantContext,
        node: &NeutralNode,
        progress: &RunProgress,
        pending_nodes: u32,
        pending_calls: u32,
    ) -> Result<Vec<PolicyViolation>> {
        let counters = BudgetCounters {
            calls_made: progress.counters.calls_made + pending_calls,
            nodes_executed: progress.counters.nodes_executed + pending_nodes,
            elapsed: progress.started.elapsed(),
            requested_tokens: node.requested_tokens,
            provider: node.provider.clone(),
            model: node.model.clone(),
        };
        self.policy.enforce_budget(tenant, &counters)?;

        let subject = PolicySubject {
            node_id: Some(node.id.clone()),
            provider: node.provider.clone(),
            model: node.model.clone(),
            components: node.components.clone(),
            live: tenant.allow_live,
        };
        let violations = self.policy.evaluate_policies(tenant, &subject);
        match first_failure(&violations) {
            Some(v) => Err(violation_error(v)),
            None => Ok(violations),
        }
    }

    fn emit_warnings(&self, violations: &[PolicyViolation]) {
        for v in violations.iter().filter(|v| v.severity == Severity::Warn) {
            warn!(rule = %v.rule_id, node_id = ?v.node_id, "Policy warning: {}", v.message);
            let mut event = AuditEvent::new(
                "policy_warning",
                json!({ "rule_id": v.rule_id, "message": v.message }),
            );
            event.node_id = v.node_id.clone();
            self.audit.emit(event);
        }
    }

    /// Grow a batch of concurrently dispatchable nodes starting at `from`.
    ///
    /// A candidate joins while it is activated, passes the gate, has no edge
    /// from a batch member, and shares no blackboard port with one in either
    /// direction. Every admitted member is assumed to make at least one call,
    /// so a batch never outruns the call budget.
    #[allow(clippy::too_many_arguments)]
    fn extend_batch<'a>(
        &self,
        flow: &FlowDefinition,
        order: &[&'a NeutralNode],
        from: usize,
        tenant: &TenantContext,
        reachable: &HashSet<String>,
        progress: &RunProgress,
        batch: &mut Vec<(&'a NeutralNode, Vec<PolicyViolation>)>,
    ) {
        for candidate in order.iter().skip(from) {
            if self.cancel.is_cancelled() {
                break;
            }
            let depends_on_batch = flow.edges.iter().any(|e| {
                e.target == candidate.id && batch.iter().any(|(n, _)| n.id == e.source)
            });
            if depends_on_batch {
                break;
            }
            let shares_ports = batch.iter().any(|(n, _)| {
                candidate.input_ports.iter().any(|p| n.output_ports.contains(p))
                    || candidate.output_ports.iter().any(|p| n.input_ports.contains(p))
                    || candidate.output_ports.iter().any(|p| n.output_ports.contains(p))
            });
            if shares_ports {
                break;
            }
            if self
                .skip_reason(flow, candidate, reachable, progress)
                .is_some()
            {
                break;
            }
            let pending = batch.len() as u32;
            match self.gate(tenant, candidate, progress, pending, pending) {
                Ok(warnings) => batch.push((*candidate, warnings)),
                Err(_) => break,
            }
        }
    }

    /// Invoke the node's runner. Runner errors become a FAIL result.
    async fn execute_node(
        &self,
        node: &NeutralNode,
        tenant: &TenantContext,
        progress: &RunProgress,
    ) -> NodeRunResult {
        info!(node_id = %node.id, label = %node.label, "Executing flow node");
        self.audit.emit(
            AuditEvent::new(
                "node_started",
                json!({ "label": node.label, "runner": node.runner }),
            )
            .for_node(&node.id),
        );

        let captured: Arc<Mutex<Vec<AuditEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let emit: EmitFn = {
            let audit = self.audit.clone();
            let captured = Arc::clone(&captured);
            Arc::new(move |event: AuditEvent| {
                if let Ok(mut events) = captured.lock() {
                    events.push(event.clone());
                }
                audit.emit(event);
            })
        };
        let ctx = RunContext::new(
            progress.run_id.clone(),
            tenant.tenant_id.clone(),
            node.id.clone(),
            tenant.allow_live,
            tenant.budget.max_tokens_per_call,
            self.cancel.clone(),
            Arc::clone(&progress.blackboard),
            emit,
        );

        let started_at = Utc::now();
        let outcome = match self.registry.resolve(node) {
            Ok(runner) => runner.execute(node, ctx).await,
            Err(e) => Err(e),
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(node_id = %node.id, error = %e, "Flow node failed");
                NodeRunResult::fail(&node.id, format!("node execution error: {}", e))
                    .with_error(e.to_string())
            }
        };

        if result.node_id != node.id {
            warn!(node_id = %node.id, reported = %result.node_id, "Runner reported a different node id");
            result.node_id = node.id.clone();
        }
        result.started_at = started_at;
        result.finished_at = Utc::now();

        let own = std::mem::take(&mut result.events);
        let mut events = captured.lock().map(|e| e.clone()).unwrap_or_default();
        for mut event in own {
            if event.node_id.is_none() {
                event.node_id = Some(node.id.clone());
            }
            self.audit.emit(event.clone());
            events.push(event);
        }
        result.events = events;
        result
    }

    /// Apply a node's writes and artifacts, update the ledger and counters,
    /// and append the result.
    fn finish_node(&self, progress: &mut RunProgress, node: &NeutralNode, mut result: NodeRunResult) {
        for (key, value) in &result.writes {
            if let Err(e) = progress.blackboard.set(key, value.clone()) {
                warn!(node_id = %node.id, key = %key, error = %e, "Blackboard write failed");
                result.error.get_or_insert_with(|| e.to_string());
            }
        }

        if let Some(ref writer) = self.artifacts {
            if !result.content.is_empty() {
                let report = writer.write(&node.artifacts, &result.content);
                result.artifacts.extend(report.written);
                for e in report.failed {
                    warn!(node_id = %node.id, error = %e, "Artifact write failed");
                    let artifact_id = match e {
                        FlowError::ArtifactWrite { ref artifact_id, .. } => Some(artifact_id.clone()),
                        _ => None,
                    };
                    self.audit.emit(
                        AuditEvent::new(
                            "artifact_write_failed",
                            json!({ "artifact_id": artifact_id, "error": e.to_string() }),
                        )
                        .for_node(&node.id),
                    );
                }
            }
        }

        self.track_connectivity(node, &result);

        progress.counters.calls_made += result.usage.calls;
        progress.counters.nodes_executed += 1;

        debug!(
            node_id = %node.id,
            status = %result.status,
            duration_ms = result.duration_ms(),
            calls = result.usage.calls,
            "Node execution complete"
        );
        self.audit.emit(
            AuditEvent::new(
                "node_finished",
                json!({
                    "status": result.status,
                    "reason": result.reason,
                    "duration_ms": result.duration_ms(),
                    "calls": result.usage.calls,
                    "tokens": result.usage.tokens,
                    "artifacts": result.artifacts.len(),
                    "error": result.error,
                }),
            )
            .for_node(&node.id),
        );

        progress.statuses.insert(node.id.clone(), result.status);
        progress.results.push(result);
    }

    /// Record live passes in the ledger and flag regressions on live failures.
    fn track_connectivity(&self, node: &NeutralNode, result: &NodeRunResult) {
        if !result.usage.live {
            return;
        }
        let Some(provider) = result.usage.provider.as_ref().or(node.provider.as_ref()) else {
            return;
        };

        match result.status {
            NodeStatus::Pass => {
                let mode = result.usage.mode_id.as_deref().unwrap_or("live");
                if let Err(e) = self.ledger.record_pass(provider, mode) {
                    warn!(provider = %provider, error = %e, "Failed to update connectivity ledger");
                }
            }
            NodeStatus::Fail => match self.ledger.is_regressed(provider, false) {
                Ok(true) => {
                    let record = self.ledger.check_status(provider).unwrap_or_default();
                    warn!(provider = %provider, node_id = %node.id, "Provider regressed: live call failed after earlier passes");
                    self.audit.emit(
                        AuditEvent::new(
                            "provider_regressed",
                            json!({
                                "provider": provider,
                                "last_mode_id": record.last_mode_id,
                                "last_pass_ts": record.last_pass_ts,
                            }),
                        )
                        .for_node(&node.id),
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(provider = %provider, error = %e, "Failed to read connectivity ledger"),
            },
            NodeStatus::Skip => {}
        }
    }

    fn record_skip(&self, progress: &mut RunProgress, node: &NeutralNode, reason: &str) {
        debug!(node_id = %node.id, reason, "Skipping node");
        self.audit.emit(
            AuditEvent::new("node_skipped", json!({ "reason": reason })).for_node(&node.id),
        );
        progress.statuses.insert(node.id.clone(), NodeStatus::Skip);
        progress.results.push(NodeRunResult::skip(&node.id, reason));
    }

    fn cancel_remaining(&self, progress: &mut RunProgress, remaining: &[&NeutralNode]) {
        info!(run_id = %progress.run_id, remaining = remaining.len(), "Flow run cancelled");
        for node in remaining {
            self.record_skip(progress, node, REASON_CANCELLED);
        }
        self.audit.emit(AuditEvent::new(
            "run_cancelled",
            json!({ "run_id": progress.run_id.0, "skipped": remaining.len() }),
        ));
    }

    /// Emit `run_aborted` and return the abort reason.
    fn abort(&self, progress: &RunProgress, node_id: Option<&str>, err: &FlowError) -> String {
        let reason = err.to_string();
        warn!(run_id = %progress.run_id, node_id = ?node_id, reason = %reason, "Flow run aborted");

        let mut payload = json!({
            "run_id": progress.run_id.0,
            "reason": reason,
            "executed": progress.counters.nodes_executed,
        });
        if let FlowError::BudgetExceeded { limit, .. } = err {
            payload["limit"] = json!(limit);
        }
        if let FlowError::PolicyViolation { rule_id, .. } = err {
            payload["rule_id"] = json!(rule_id);
        }
        let mut event = AuditEvent::new("run_aborted", payload);
        event.node_id = node_id.map(str::to_string);
        self.audit.emit(event);
        reason
    }
}

fn violation_error(v: &PolicyViolation) -> FlowError {
    FlowError::PolicyViolation {
        rule_id: v.rule_id.clone(),
        message: v.message.clone(),
    }
}


/// Write schema defaults for absent keys, then the run inputs.
fn seed_blackboard(
    blackboard: &dyn Blackboard,
    flow: &FlowDefinition,
    inputs: HashMap<String, serde_json::Value>,
) -> Result<()> {
    for (key, default) in &flow.blackboard_schema {
        if blackboard.get(key)?.is_none() {
            blackboard.set(key, default.clone())?;
        }
    }
    for (key, value) in inputs {
        blackboard.set(&key, value)?;
    }
    Ok(())
}
