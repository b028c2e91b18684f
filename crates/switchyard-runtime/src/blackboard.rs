use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use switchyard_core::error::{FlowError, Result};
use switchyard_core::traits::Blackboard;

use crate::persist::{read_json_or_default, write_json_atomic};

type State = HashMap<String, serde_json::Value>;

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|e| FlowError::Storage(format!("blackboard lock poisoned: {}", e)))
}

fn sorted_keys(state: &State) -> Vec<String> {
    let mut keys: Vec<String> = state.keys().cloned().collect();
    keys.sort();
    keys
}

/// Ephemeral blackboard; state dies with the run.
#[derive(Debug, Default)]
pub struct MemoryBlackboard {
    state: Mutex<State>,
}

impl MemoryBlackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a blackboard seeded with initial data.
    pub fn from_map(data: State) -> Self {
        Self {
            state: Mutex::new(data),
        }
    }
}

impl Blackboard for MemoryBlackboard {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(lock(&self.state)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        lock(&self.state)?.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.state)?.remove(key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let state = lock(&self.state)?;
        Ok(sorted_keys(&state))
    }

    fn snapshot(&self) -> Result<State> {
        Ok(lock(&self.state)?.clone())
    }
}

/// Blackboard persisted as a single JSON object.
///
/// Every mutation rewrites the whole document while holding the lock; there
/// is no merging, the last writer wins. A mutation whose write fails leaves
/// both the file and the in-memory state unchanged.
#[derive(Debug)]
pub struct PersistedBlackboard {
    path: PathBuf,
    state: Mutex<State>,
}

impl PersistedBlackboard {
    /// Open the blackboard at `path`, loading prior state if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state: State = read_json_or_default(&path)?;
        debug!(path = %path.display(), keys = state.len(), "Loaded persisted blackboard");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, persist it, then commit it.
    fn mutate<T>(&self, change: impl FnOnce(&mut State) -> T) -> Result<T> {
        let mut state = lock(&self.state)?;
        let mut next = state.clone();
        let out = change(&mut next);
        write_json_atomic(&self.path, &next)?;
        *state = next;
        Ok(out)
    }
}

impl Blackboard for PersistedBlackboard {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(lock(&self.state)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.mutate(|s| {
            s.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(|s| s.remove(key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let state = lock(&self.state)?;
        Ok(sorted_keys(&state))
    }

    fn snapshot(&self) -> Result<State> {
        Ok(lock(&self.state)?.clone())
    }
}
