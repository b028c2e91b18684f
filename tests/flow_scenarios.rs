use std::collections::HashMap;

use serde_json::json;

use switchyard::{
    BudgetCard, FlowRunner, NodeRunResult, NodeRunnerRegistry, NodeStatus, NodeUsage,
    RunOutcome, RunState, TenantConfig, TenantPolicyEngine,
};
use switchyard_test_utils::{init_tracing, linear_flow, ScriptedRunner};

fn runner(script: ScriptedRunner, policy: TenantPolicyEngine) -> FlowRunner {
    let mut registry = NodeRunnerRegistry::new();
    registry.register("scripted", script);
    registry.set_default("scripted");
    FlowRunner::new(registry, policy)
}

fn default_tenant() -> TenantPolicyEngine {
    TenantPolicyEngine::new().with_tenant("default", TenantConfig::default())
}

#[tokio::test]
async fn test_linear_flow_completes_and_writes_blackboard() {
    init_tracing();
    let runner = runner(ScriptedRunner::writing("done", json!(true)), default_tenant());

    let summary = runner
        .run(&linear_flow(&["A", "B", "C"]), "acme", HashMap::new())
        .await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.outcome, RunOutcome::Pass);
    assert_eq!(summary.node_ids(), vec!["A", "B", "C"]);
    assert_eq!(summary.tenant_id, "acme");
    assert_eq!(summary.flow_id, "linear");
    assert_eq!(summary.blackboard.get("done"), Some(&json!(true)));
}

#[tokio::test]
async fn test_failed_node_still_reaches_exit() {
    init_tracing();
    let script = ScriptedRunner::writing("done", json!(true)).failing_node("B", "validation failed");
    let runner = runner(script, default_tenant());

    let summary = runner
        .run(&linear_flow(&["A", "B", "C"]), "acme", HashMap::new())
        .await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.count(NodeStatus::Fail), 1);
    assert_eq!(summary.result("C").unwrap().status, NodeStatus::Pass);
    assert_eq!(summary.outcome, RunOutcome::Fail);
}

#[tokio::test]
async fn test_call_budget_stops_after_first_node() {
    init_tracing();
    let script = ScriptedRunner::new(|node, _| {
        Ok(NodeRunResult::pass(&node.id).with_usage(NodeUsage {
            calls: 1,
            ..Default::default()
        }))
    });
    let policy = TenantPolicyEngine::new()
        .with_budget("default", BudgetCard::default().with_max_calls(1))
        .with_tenant("default", TenantConfig::default());
    let runner = runner(script, policy);

    let summary = runner.run(&linear_flow(&["A", "B"]), "acme", HashMap::new()).await;

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.node_ids(), vec!["A"]);
    assert!(summary.abort_reason.is_some());
}

#[tokio::test]
async fn test_cancelled_before_run_skips_everything() {
    init_tracing();
    let script = ScriptedRunner::passing();
    let tracker = script.tracker();
    let runner = runner(script, default_tenant());
    runner.cancel_token().cancel();

    let summary = runner
        .run(&linear_flow(&["A", "B", "C"]), "acme", HashMap::new())
        .await;

    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(summary.results.len(), 3);
    for result in &summary.results {
        assert_eq!(result.status, NodeStatus::Skip);
        assert!(result.reason.contains("cancel"));
    }
    assert!(tracker.started().is_empty());
}

#[tokio::test]
async fn test_results_carry_timestamps() {
    let runner = runner(ScriptedRunner::passing(), default_tenant());

    let summary = runner.run(&linear_flow(&["A", "B"]), "acme", HashMap::new()).await;

    for result in &summary.results {
        assert!(result.finished_at >= result.started_at);
        assert!(result.started_at >= summary.started_at);
    }
    assert!(summary.finished_at >= summary.started_at);
}
