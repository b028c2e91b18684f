//! Switchyard: a flow-graph execution runtime for multi-step agent workflows.
//!
//! A [`FlowDefinition`] is validated into a topological order, then each node
//! is dispatched to the [`NodeRunner`] registered for it. Nodes share state
//! through a [`Blackboard`]; every step is recorded as an [`AuditEvent`], and
//! tenant budgets and policy packs gate each dispatch.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use switchyard::{ConnectivityLedger, FlowDefinition, FlowRunner, NodeRunnerRegistry, RuntimeConfig};
//!
//! # async fn demo(registry: NodeRunnerRegistry, flow: FlowDefinition) -> switchyard::Result<()> {
//! let config = RuntimeConfig::load(std::path::Path::new("switchyard.toml"))?;
//! let ledger = Arc::new(ConnectivityLedger::from_config(&config)?);
//! let runner = FlowRunner::from_config(&config, registry, ledger)?;
//! let summary = runner.run(&flow, "acme", HashMap::new()).await;
//! println!("{} {:?}", summary.state, summary.outcome);
//! # Ok(())
//! # }
//! ```

pub use switchyard_core;
pub use switchyard_runtime;

pub use switchyard_core::{
    AuditSink, Blackboard, CancellationToken, EdgeCondition, FlowDefinition, FlowError, GraphEdge,
    NeutralNode, NodeRunner, Result, RunContext, RuntimeConfig,
};
pub use switchyard_core::config::TenantConfig;
pub use switchyard_core::policy::{
    BudgetCard, BudgetCounters, LimitKind, PolicyPack, PolicyRule, PolicyScope, PolicySelector,
    PolicySubject, PolicyViolation, Severity, TenantContext,
};
pub use switchyard_core::types::*;

pub use switchyard_runtime::{
    reachable_from, ArtifactReport, ArtifactWriter, AuditEmitter, CompositeSink, ConnectivityLedger,
    ConnectivityRecord, ConsoleSink, FlowRunner, GraphValidator, JsonlSink, MemoryBlackboard,
    MemorySink, NodeRunnerRegistry, NullSink, PersistedBlackboard, TenantPolicyEngine,
};
