use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::policy::{BudgetCard, PolicyPack};

/// Top-level Switchyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Budget cards by name.
    #[serde(default)]
    pub budgets: HashMap<String, BudgetCard>,
    /// Policy packs by name.
    #[serde(default)]
    pub policy_packs: HashMap<String, PolicyPack>,
    /// Tenants by id. A tenant named `default` catches unknown tenant ids.
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Directory for node artifacts. Artifacts are not written when unset.
    #[serde(default)]
    pub artifacts_dir: Option<String>,
    /// JSONL audit log file.
    #[serde(default)]
    pub audit_log: Option<String>,
    /// Persisted blackboard file. The blackboard is in-memory when unset.
    #[serde(default)]
    pub blackboard_path: Option<String>,
    /// Connectivity ledger file. The ledger is in-memory when unset.
    #[serde(default)]
    pub ledger_path: Option<String>,
    /// Also print audit events to the console.
    #[serde(default)]
    pub console_audit: bool,
    /// Dispatch independent branches concurrently.
    #[serde(default)]
    pub parallel_branches: bool,
    /// Global switch for live provider calls.
    #[serde(default = "default_allow_live")]
    pub allow_live: bool,
    /// Runner key used by nodes that do not name one.
    #[serde(default)]
    pub default_runner: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            artifacts_dir: None,
            audit_log: None,
            blackboard_path: None,
            ledger_path: None,
            console_audit: false,
            parallel_branches: false,
            allow_live: default_allow_live(),
            default_runner: None,
        }
    }
}

fn default_allow_live() -> bool { true }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Names of policy packs applied to this tenant.
    #[serde(default)]
    pub policy_packs: Vec<String>,
    /// Name of the budget card. Falls back to the `default` budget, then to
    /// built-in limits.
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub allow_live: bool,
}

impl RuntimeConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    pub fn artifacts_dir(&self) -> Option<PathBuf> {
        self.runtime.artifacts_dir.as_deref().map(expand_home)
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        self.runtime.audit_log.as_deref().map(expand_home)
    }

    pub fn blackboard_path(&self) -> Option<PathBuf> {
        self.runtime.blackboard_path.as_deref().map(expand_home)
    }

    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.runtime.ledger_path.as_deref().map(expand_home)
    }
}

/// Expand a leading `~/` against `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
