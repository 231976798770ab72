//! In-memory state backend, used by tests and single-run deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{check_id, StateStore};
use crate::types::StateError;

/// A `StateStore` keeping every document in process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    docs: DashMap<String, Map<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, id: &str, key: &str) -> Result<Option<Value>, StateError> {
        check_id(id)?;
        Ok(self.docs.get(id).and_then(|doc| doc.get(key).cloned()))
    }

    async fn write(&self, id: &str, key: &str, value: Value) -> Result<(), StateError> {
        check_id(id)?;
        self.docs
            .entry(id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, id: &str, key: &str) -> Result<(), StateError> {
        check_id(id)?;
        if let Some(mut doc) = self.docs.get_mut(id) {
            doc.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, id: &str) -> Result<(), StateError> {
        check_id(id)?;
        self.docs.remove(id);
        Ok(())
    }

    async fn state_ids(&self) -> Result<Vec<String>, StateError> {
        Ok(self.docs.iter().map(|entry| entry.key().clone()).collect())
    }
}
