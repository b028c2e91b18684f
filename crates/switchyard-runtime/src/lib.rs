pub mod artifacts;
pub mod audit;
pub mod blackboard;
pub mod ledger;
mod persist;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod validator;

pub use artifacts::{ArtifactReport, ArtifactWriter};
pub use audit::{AuditEmitter, CompositeSink, ConsoleSink, JsonlSink, MemorySink, NullSink};
pub use blackboard::{MemoryBlackboard, PersistedBlackboard};
pub use ledger::{ConnectivityLedger, ConnectivityRecord};
pub use policy::TenantPolicyEngine;
pub use registry::NodeRunnerRegistry;
pub use runner::FlowRunner;
pub use validator::{reachable_from, GraphValidator};
