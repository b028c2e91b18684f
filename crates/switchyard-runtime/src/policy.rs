use std::collections::HashMap;

use tracing::debug;

use switchyard_core::config::{RuntimeConfig, TenantConfig};
use switchyard_core::error::{FlowError, Result};
use switchyard_core::policy::{
    BudgetCard, BudgetCounters, LimitKind, PolicyPack, PolicyScope, PolicySubject,
    PolicyViolation, Severity, TenantContext,
};

/// Name of the tenant used for ids that are not configured, and of the
/// budget used by tenants that do not name one.
pub const DEFAULT_KEY: &str = "default";

/// Resolves tenants to their packs and budget, and enforces both.
#[derive(Debug, Clone)]
pub struct TenantPolicyEngine {
    tenants: HashMap<String, TenantConfig>,
    packs: HashMap<String, PolicyPack>,
    budgets: HashMap<String, BudgetCard>,
    allow_live: bool,
}

impl Default for TenantPolicyEngine {
    fn default() -> Self {
        Self {
            tenants: HashMap::new(),
            packs: HashMap::new(),
            budgets: HashMap::new(),
            allow_live: true,
        }
    }
}

impl TenantPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config, failing if any tenant references an unknown pack or budget.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let engine = Self {
            tenants: config.tenants.clone(),
            packs: config.policy_packs.clone(),
            budgets: config.budgets.clone(),
            allow_live: config.runtime.allow_live,
        };
        for tenant_id in engine.tenants.keys() {
            engine.resolve(tenant_id)?;
        }
        Ok(engine)
    }

    pub fn with_tenant(mut self, id: impl Into<String>, tenant: TenantConfig) -> Self {
        self.tenants.insert(id.into(), tenant);
        self
    }

    pub fn with_pack(mut self, name: impl Into<String>, pack: PolicyPack) -> Self {
        self.packs.insert(name.into(), pack);
        self
    }

    pub fn with_budget(mut self, name: impl Into<String>, budget: BudgetCard) -> Self {
        self.budgets.insert(name.into(), budget);
        self
    }

    /// Global switch for live calls, ANDed with each tenant's own flag.
    pub fn with_allow_live(mut self, allow: bool) -> Self {
        self.allow_live = allow;
        self
    }

    /// Resolve a tenant's packs and budget and derive `allow_live`.
    ///
    /// Unknown tenant ids fall back to the `default` tenant when one is configured.
    pub fn resolve(&self, tenant_id: &str) -> Result<TenantContext> {
        let tenant = self
            .tenants
            .get(tenant_id)
            .or_else(|| self.tenants.get(DEFAULT_KEY))
            .ok_or_else(|| FlowError::UnknownTenant(tenant_id.to_string()))?;

        let mut packs = Vec::with_capacity(tenant.policy_packs.len());
        for name in &tenant.policy_packs {
            let mut pack = self.packs.get(name).cloned().ok_or_else(|| {
                FlowError::Config(format!(
                    "tenant '{}' references unknown policy pack '{}'",
                    tenant_id, name
                ))
            })?;
            if pack.name.is_empty() {
                pack.name = name.clone();
            }
            packs.push(pack);
        }

        let budget = match tenant.budget {
            Some(ref name) => self.budgets.get(name).cloned().ok_or_else(|| {
                FlowError::Config(format!(
                    "tenant '{}' references unknown budget '{}'",
                    tenant_id, name
                ))
            })?,
            None => self.budgets.get(DEFAULT_KEY).cloned().unwrap_or_default(),
        };

        let allow_live = self.allow_live
            && tenant.allow_live
            && budget.max_calls_per_run > 0
            && budget.allowed_providers.as_ref().map_or(true, |p| !p.is_empty());

        debug!(tenant = tenant_id, packs = packs.len(), allow_live, "Resolved tenant");

        Ok(TenantContext {
            tenant_id: tenant_id.to_string(),
            policy_packs: packs,
            budget,
            allow_live,
        })
    }

    /// Check the run's counters against the tenant's budget.
    pub fn enforce_budget(&self, ctx: &TenantContext, counters: &BudgetCounters) -> Result<()> {
        let budget = &ctx.budget;
        let exceeded = |limit, detail: String| Err(FlowError::BudgetExceeded { limit, detail });

        if counters.calls_made >= budget.max_calls_per_run {
            return exceeded(
                LimitKind::Calls,
                format!(
                    "{} of {} calls used",
                    counters.calls_made, budget.max_calls_per_run
                ),
            );
        }
        if counters.nodes_executed >= budget.max_nodes_per_run {
            return exceeded(
                LimitKind::Nodes,
                format!(
                    "{} of {} nodes executed",
                    counters.nodes_executed, budget.max_nodes_per_run
                ),
            );
        }
        if counters.elapsed.as_secs_f64() > budget.timeout_seconds as f64 {
            return exceeded(
                LimitKind::Timeout,
                format!(
                    "{:.1}s elapsed, limit {}s",
                    counters.elapsed.as_secs_f64(),
                    budget.timeout_seconds
                ),
            );
        }
        if let Some(tokens) = counters.requested_tokens {
            if tokens > budget.max_tokens_per_call {
                return exceeded(
                    LimitKind::Tokens,
                    format!(
                        "{} tokens requested, limit {}",
                        tokens, budget.max_tokens_per_call
                    ),
                );
            }
        }
        if let (Some(allowed), Some(provider)) = (&budget.allowed_providers, &counters.provider) {
            if !allowed.iter().any(|p| p == provider) {
                return exceeded(
                    LimitKind::Provider,
                    format!("provider '{}' is not allowed", provider),
                );
            }
        }
        if let (Some(allowed), Some(model)) = (&budget.allowed_models, &counters.model) {
            if !allowed.iter().any(|m| m == model) {
                return exceeded(
                    LimitKind::Model,
                    format!("model '{}' is not allowed", model),
                );
            }
        }
        Ok(())
    }

    /// Rules of the tenant's packs that apply to `subject`.
    ///
    /// A subject without a node id is the run itself and sees `run` rules;
    /// a node subject sees `node` rules. `any` rules apply to both.
    pub fn evaluate_policies(
        &self,
        ctx: &TenantContext,
        subject: &PolicySubject,
    ) -> Vec<PolicyViolation> {
        let point = if subject.node_id.is_some() {
            PolicyScope::Node
        } else {
            PolicyScope::Run
        };
        ctx.rules()
            .filter(|rule| rule.scope.covers(point) && rule.selector.matches(subject))
            .map(|rule| PolicyViolation {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                message: if rule.message.is_empty() {
                    format!("policy rule '{}' matched", rule.id)
                } else {
                    rule.message.clone()
                },
                node_id: subject.node_id.clone(),
            })
            .collect()
    }
}

/// The first FAIL-severity violation, if any.
pub fn first_failure(violations: &[PolicyViolation]) -> Option<&PolicyViolation> {
    violations.iter().find(|v| v.severity == Severity::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_core::policy::{PolicyRule, PolicySelector};

    fn engine() -> TenantPolicyEngine {
        let pack = PolicyPack {
            name: String::new(),
            rules: vec![
                PolicyRule {
                    id: "no-shell".into(),
                    severity: Severity::Fail,
                    scope: PolicyScope::Node,
                    selector: PolicySelector {
                        component: Some("shell".into()),
                        ..Default::default()
                    },
                    message: "shell access is not permitted".into(),
                },
                PolicyRule {
                    id: "live-bedrock".into(),
                    severity: Severity::Warn,
                    scope: PolicyScope::Any,
                    selector: PolicySelector {
                        provider: Some("bedrock".into()),
                        live: Some(true),
                        ..Default::default()
                    },
                    message: String::new(),
                },
                PolicyRule {
                    id: "run-banner".into(),
                    severity: Severity::Warn,
                    scope: PolicyScope::Run,
                    selector: PolicySelector::default(),
                    message: "runs are audited".into(),
                },
            ],
        };
        TenantPolicyEngine::new()
            .with_pack("baseline", pack)
            .with_budget("tight", BudgetCard::default().with_max_calls(2))
            .with_tenant(
                "acme",
                TenantConfig {
                    policy_packs: vec!["baseline".into()],
                    budget: Some("tight".into()),
                    allow_live: true,
                },
            )
    }

    #[test]
    fn test_resolve_tenant() {
        let ctx = engine().resolve("acme").unwrap();
        assert_eq!(ctx.tenant_id, "acme");
        assert_eq!(ctx.policy_packs.len(), 1);
        assert_eq!(ctx.policy_packs[0].name, "baseline");
        assert_eq!(ctx.budget.max_calls_per_run, 2);
        assert!(ctx.allow_live);
    }

    #[test]
    fn test_unknown_tenant_and_default_fallback() {
        assert!(matches!(
            engine().resolve("globex"),
            Err(FlowError::UnknownTenant(ref t)) if t == "globex"
        ));

        let with_default = engine().with_tenant(DEFAULT_KEY, TenantConfig::default());
        let ctx = with_default.resolve("globex").unwrap();
        assert_eq!(ctx.tenant_id, "globex");
        assert!(ctx.policy_packs.is_empty());
        assert_eq!(ctx.budget, BudgetCard::default());
        assert!(!ctx.allow_live);
    }

    #[test]
    fn test_allow_live_derivation() {
        let e = engine().with_allow_live(false);
        assert!(!e.resolve("acme").unwrap().allow_live);

        let e = engine()
            .with_budget("closed", BudgetCard::default().with_providers(vec![]))
            .with_tenant(
                "closed",
                TenantConfig {
                    policy_packs: vec![],
                    budget: Some("closed".into()),
                    allow_live: true,
                },
            );
        assert!(!e.resolve("closed").unwrap().allow_live);

        let e = engine()
            .with_budget("zero", BudgetCard::default().with_max_calls(0))
            .with_tenant(
                "zero",
                TenantConfig {
                    policy_packs: vec![],
                    budget: Some("zero".into()),
                    allow_live: true,
                },
            );
        assert!(!e.resolve("zero").unwrap().allow_live);
    }

    #[test]
    fn test_from_config_fails_fast_on_dangling_reference() {
        let config = RuntimeConfig::from_toml_str(
            r#"
[tenants.acme]
policy_packs = ["missing"]
"#,
        )
        .unwrap();
        assert!(matches!(
            TenantPolicyEngine::from_config(&config),
            Err(FlowError::Config(_))
        ));

        let config = RuntimeConfig::from_toml_str(
            r#"
[tenants.acme]
budget = "nope"
"#,
        )
        .unwrap();
        assert!(TenantPolicyEngine::from_config(&config).is_err());
    }

    #[test]
    fn test_calls_limit_is_inclusive() {
        let e = engine();
        let ctx = e.resolve("acme").unwrap();
        let mut counters = BudgetCounters {
            calls_made: 1,
            ..Default::default()
        };
        assert!(e.enforce_budget(&ctx, &counters).is_ok());

        counters.calls_made = 2;
        assert!(matches!(
            e.enforce_budget(&ctx, &counters),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Calls, .. })
        ));
    }

    #[test]
    fn test_node_count_timeout_and_tokens() {
        let e = TenantPolicyEngine::new();
        let ctx = TenantContext::new(
            "t",
            BudgetCard::default().with_max_nodes(3).with_timeout_secs(10),
        );

        let nodes = BudgetCounters {
            nodes_executed: 3,
            ..Default::default()
        };
        assert!(matches!(
            e.enforce_budget(&ctx, &nodes),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Nodes, .. })
        ));

        let at_limit = BudgetCounters {
            elapsed: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(e.enforce_budget(&ctx, &at_limit).is_ok());
        let over = BudgetCounters {
            elapsed: Duration::from_millis(10_001),
            ..Default::default()
        };
        assert!(matches!(
            e.enforce_budget(&ctx, &over),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Timeout, .. })
        ));

        let tokens = BudgetCounters {
            requested_tokens: Some(ctx.budget.max_tokens_per_call + 1),
            ..Default::default()
        };
        assert!(matches!(
            e.enforce_budget(&ctx, &tokens),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Tokens, .. })
        ));
    }

    #[test]
    fn test_allow_lists() {
        let e = TenantPolicyEngine::new();
        let request = BudgetCounters {
            provider: Some("vertex".into()),
            model: Some("gemini".into()),
            ..Default::default()
        };

        let open = TenantContext::new("t", BudgetCard::default());
        assert!(e.enforce_budget(&open, &request).is_ok());

        let providers = TenantContext::new(
            "t",
            BudgetCard::default().with_providers(vec!["bedrock".into()]),
        );
        assert!(matches!(
            e.enforce_budget(&providers, &request),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Provider, .. })
        ));

        let nothing = TenantContext::new("t", BudgetCard::default().with_models(vec![]));
        assert!(matches!(
            e.enforce_budget(&nothing, &request),
            Err(FlowError::BudgetExceeded { limit: LimitKind::Model, .. })
        ));

        // A node with no provider is not subject to the provider list.
        let unbound = BudgetCounters::default();
        assert!(e.enforce_budget(&providers, &unbound).is_ok());
    }

    #[test]
    fn test_policy_scopes_and_selectors() {
        let e = engine();
        let ctx = e.resolve("acme").unwrap();

        let run = PolicySubject {
            live: true,
            ..Default::default()
        };
        let ids: Vec<String> = e
            .evaluate_policies(&ctx, &run)
            .into_iter()
            .map(|v| v.rule_id)
            .collect();
        assert_eq!(ids, vec!["run-banner"]);

        let node = PolicySubject {
            node_id: Some("exec".into()),
            provider: Some("bedrock".into()),
            components: vec!["shell".into()],
            live: true,
            ..Default::default()
        };
        let violations = e.evaluate_policies(&ctx, &node);
        assert_eq!(violations.len(), 2);
        let fail = first_failure(&violations).unwrap();
        assert_eq!(fail.rule_id, "no-shell");
        assert_eq!(fail.node_id.as_deref(), Some("exec"));
        assert_eq!(violations[1].message, "policy rule 'live-bedrock' matched");

        let simulated = PolicySubject {
            live: false,
            ..node
        };
        let violations = e.evaluate_policies(&ctx, &simulated);
        assert_eq!(violations.len(), 1);
    }
}
