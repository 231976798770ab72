//! Persistent per-agent state.
//!
//! Every agent id owns one keyed JSON document. The host only relies on
//! atomic single-key writes; multi-key transactions are out of scope.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::StateError;

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

/// Persistent KV store, one namespace per agent id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a single key from the agent's document.
    async fn read(&self, id: &str, key: &str) -> Result<Option<Value>, StateError>;

    /// Write a single key. The write is atomic per key and observable to the
    /// next `read` of that key through any store on the same backend.
    async fn write(&self, id: &str, key: &str, value: Value) -> Result<(), StateError>;

    /// Remove a single key. Removing a missing key is a no-op.
    async fn remove(&self, id: &str, key: &str) -> Result<(), StateError>;

    /// Drop the agent's entire document.
    async fn delete_all(&self, id: &str) -> Result<(), StateError>;

    /// Enumerate every agent id known to the backend.
    async fn state_ids(&self) -> Result<Vec<String>, StateError>;
}

/// Which backend to use for persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    File,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            path: PathBuf::from("./data/state"),
        }
    }
}

/// Build a state store from configuration.
pub fn build_store(config: &StateConfig) -> Result<Arc<dyn StateStore>, StateError> {
    match config.backend {
        StateBackend::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StateBackend::File => Ok(Arc::new(FileStateStore::new(config.path.clone())?)),
    }
}

/// Reject ids that could escape the backend namespace.
pub(crate) fn check_id(id: &str) -> Result<(), StateError> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
    {
        return Err(StateError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation_rejects_path_escapes() {
        assert!(check_id("plain-agent_1").is_ok());
        assert!(check_id("").is_err());
        assert!(check_id("a/b").is_err());
        assert!(check_id("..").is_err());
        assert!(check_id(".hidden").is_err());
    }

    #[test]
    fn config_defaults_to_memory() {
        let config = StateConfig::default();
        assert_eq!(config.backend, StateBackend::Memory);
        assert!(build_store(&config).is_ok());
    }
}
