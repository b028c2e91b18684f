pub mod cancel;
pub mod config;
pub mod error;
pub mod graph;
pub mod policy;
pub mod traits;
pub mod types;

pub use cancel::CancellationToken;
pub use config::RuntimeConfig;
pub use error::{FlowError, Result};
pub use graph::{EdgeCondition, FlowDefinition, GraphEdge, NeutralNode};
pub use traits::{AuditSink, Blackboard, NodeRunner, RunContext};
pub use types::*;
