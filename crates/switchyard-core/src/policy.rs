use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Severity of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Matching aborts the run.
    #[serde(alias = "fail")]
    Fail,
    /// Matching is recorded to the audit trail; execution continues.
    #[serde(alias = "warn")]
    Warn,
}

/// Where in a run a rule is evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    /// Once, before the first node.
    Run,
    /// Before every node.
    #[default]
    Node,
    /// Both.
    Any,
}

impl PolicyScope {
    pub fn covers(&self, point: PolicyScope) -> bool {
        *self == PolicyScope::Any || *self == point
    }
}

/// Field selector of a rule. Every field is optional; a rule applies when all
/// present fields match the subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySelector {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Matches when the subject has this component mounted.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub live: Option<bool>,
}

impl PolicySelector {
    pub fn matches(&self, subject: &PolicySubject) -> bool {
        fn field(want: &Option<String>, have: &Option<String>) -> bool {
            match want {
                None => true,
                Some(w) => have.as_deref() == Some(w.as_str()),
            }
        }

        field(&self.node_id, &subject.node_id)
            && field(&self.provider, &subject.provider)
            && field(&self.model, &subject.model)
            && self
                .component
                .as_ref()
                .map_or(true, |c| subject.components.iter().any(|s| s == c))
            && self.live.map_or(true, |l| l == subject.live)
    }
}

/// A single rule in a policy pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub scope: PolicyScope,
    #[serde(default)]
    pub selector: PolicySelector,
    #[serde(default)]
    pub message: String,
}

/// Named set of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPack {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Quantitative limits for a run.
///
/// For the allow-lists, `None` means unrestricted while `Some(vec![])` means
/// nothing is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCard {
    #[serde(default = "default_max_calls")]
    pub max_calls_per_run: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_call: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes_per_run: u32,
    #[serde(default)]
    pub allowed_providers: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
}

fn default_max_calls() -> u32 { 50 }
fn default_max_tokens() -> u64 { 8192 }
fn default_timeout_secs() -> u64 { 600 }
fn default_max_nodes() -> u32 { 100 }

impl Default for BudgetCard {
    fn default() -> Self {
        Self {
            max_calls_per_run: default_max_calls(),
            max_tokens_per_call: default_max_tokens(),
            timeout_seconds: default_timeout_secs(),
            max_nodes_per_run: default_max_nodes(),
            allowed_providers: None,
            allowed_models: None,
        }
    }
}

impl BudgetCard {
    pub fn with_max_calls(mut self, calls: u32) -> Self {
        self.max_calls_per_run = calls;
        self
    }

    pub fn with_max_nodes(mut self, nodes: u32) -> Self {
        self.max_nodes_per_run = nodes;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.allowed_providers = Some(providers);
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.allowed_models = Some(models);
        self
    }
}

/// A tenant with its policy packs and budget resolved.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub policy_packs: Vec<PolicyPack>,
    pub budget: BudgetCard,
    /// Whether nodes may perform live provider calls.
    pub allow_live: bool,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, budget: BudgetCard) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            policy_packs: Vec::new(),
            budget,
            allow_live: false,
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.policy_packs.iter().flat_map(|p| p.rules.iter())
    }
}

/// Which budget limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Calls,
    Tokens,
    Timeout,
    Nodes,
    Provider,
    Model,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Calls => "calls",
            Self::Tokens => "tokens",
            Self::Timeout => "timeout",
            Self::Nodes => "nodes",
            Self::Provider => "provider",
            Self::Model => "model",
        };
        write!(f, "{}", s)
    }
}

/// Usage so far in a run plus what the next node requests.
#[derive(Debug, Clone, Default)]
pub struct BudgetCounters {
    pub calls_made: u32,
    pub nodes_executed: u32,
    /// Wall-clock time since run start.
    pub elapsed: Duration,
    pub requested_tokens: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// What a policy rule is evaluated against: the run as a whole or one node.
#[derive(Debug, Clone, Default)]
pub struct PolicySubject {
    pub node_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub components: Vec<String>,
    pub live: bool,
}

/// A rule that matched its subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub node_id: Option<String>,
}
