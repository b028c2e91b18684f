use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use switchyard_core::config::RuntimeConfig;
use switchyard_core::error::{FlowError, Result};

use crate::persist::{read_json_or_default, write_json_atomic};

/// Live-call history of one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityRecord {
    pub ever_passed: bool,
    pub last_mode_id: Option<String>,
    pub last_pass_ts: Option<DateTime<Utc>>,
}

type Records = BTreeMap<String, ConnectivityRecord>;

/// Durable cross-run record of which providers have ever completed a live call.
///
/// Stored as a JSON object keyed by provider id. This is the one store shared
/// between runs; construct it once and hand the same instance to every runner.
#[derive(Debug)]
pub struct ConnectivityLedger {
    path: Option<PathBuf>,
    records: Mutex<Records>,
}

impl ConnectivityLedger {
    /// Open the ledger at `path`, loading existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records: Records = read_json_or_default(&path)?;
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Records::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|e| FlowError::Storage(format!("ledger lock poisoned: {}", e)))
    }

    /// Open the ledger configured by `runtime.ledger_path`, or an in-memory
    /// one when no path is set.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        match config.ledger_path() {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Record a successful live call, creating the provider's record on first pass.
    pub fn record_pass(&self, provider_id: &str, mode_id: &str) -> Result<()> {
        let mut records = self.lock()?;
        let mut next = records.clone();
        let first = !next.contains_key(provider_id);
        next.insert(
            provider_id.to_string(),
            ConnectivityRecord {
                ever_passed: true,
                last_mode_id: Some(mode_id.to_string()),
                last_pass_ts: Some(Utc::now()),
            },
        );
        if let Some(ref path) = self.path {
            write_json_atomic(path, &next)?;
        }
        *records = next;

        if first {
            info!(provider = provider_id, mode = mode_id, "First live pass recorded");
        }
        Ok(())
    }

    /// The provider's record, or an all-false record if it has never passed.
    pub fn check_status(&self, provider_id: &str) -> Result<ConnectivityRecord> {
        Ok(self.lock()?.get(provider_id).cloned().unwrap_or_default())
    }

    /// A provider has regressed when it passed before and is unavailable now.
    pub fn is_regressed(&self, provider_id: &str, current_available: bool) -> Result<bool> {
        if current_available {
            return Ok(false);
        }
        Ok(self.check_status(provider_id)?.ever_passed)
    }

    /// Providers with a record, sorted.
    pub fn providers(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unknown_provider_default_record() {
        let ledger = ConnectivityLedger::in_memory();
        let rec = ledger.check_status("vertex").unwrap();
        assert_eq!(rec, ConnectivityRecord::default());
        assert!(!rec.ever_passed);
        assert!(rec.last_mode_id.is_none());
        assert!(rec.last_pass_ts.is_none());
    }

    #[test]
    fn test_regression_rules() {
        let ledger = ConnectivityLedger::in_memory();
        assert!(!ledger.is_regressed("bedrock", false).unwrap());
        assert!(!ledger.is_regressed("bedrock", true).unwrap());

        ledger.record_pass("bedrock", "sdk").unwrap();
        assert!(ledger.is_regressed("bedrock", false).unwrap());
        assert!(!ledger.is_regressed("bedrock", true).unwrap());
    }

    #[test]
    fn test_record_pass_updates_mode() {
        let ledger = ConnectivityLedger::in_memory();
        ledger.record_pass("bedrock", "sdk").unwrap();
        let first = ledger.check_status("bedrock").unwrap();
        ledger.record_pass("bedrock", "rest").unwrap();
        let second = ledger.check_status("bedrock").unwrap();
        assert_eq!(second.last_mode_id.as_deref(), Some("rest"));
        assert!(second.last_pass_ts >= first.last_pass_ts);
        assert_eq!(ledger.providers().unwrap(), vec!["bedrock"]);
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        ConnectivityLedger::open(&path)
            .unwrap()
            .record_pass("vertex", "adk")
            .unwrap();

        let reopened = ConnectivityLedger::open(&path).unwrap();
        assert!(reopened.is_regressed("vertex", false).unwrap());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["vertex"]["ever_passed"], true);
        assert_eq!(raw["vertex"]["last_mode_id"], "adk");
        assert!(raw["vertex"]["last_pass_ts"].is_string());
    }

    #[test]
    fn test_reads_null_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"crewai": {"ever_passed": false, "last_mode_id": null, "last_pass_ts": null}}"#,
        )
        .unwrap();
        let ledger = ConnectivityLedger::open(&path).unwrap();
        assert!(!ledger.check_status("crewai").unwrap().ever_passed);
        assert!(!ledger.is_regressed("crewai", false).unwrap());
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ConnectivityLedger::open(dir.path().join("ledger.json")).unwrap());
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.record_pass(&format!("p{}", i), "live").unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let reopened = ConnectivityLedger::open(dir.path().join("ledger.json")).unwrap();
        assert_eq!(reopened.providers().unwrap().len(), 6);
    }
}
