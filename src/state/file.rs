//! File-backed state: one JSON document per agent id.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{check_id, StateStore};
use crate::types::StateError;

/// A `StateStore` writing each agent's document to `<root>/<id>.json`.
///
/// Writes replace the whole document through a temp-file rename, so a single
/// key update is atomic on the filesystem. A per-id mutex serializes
/// read-modify-write cycles within the process.
pub struct FileStateStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self, StateError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            StateError::backend(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_doc(&self, id: &str) -> Result<Map<String, Value>, StateError> {
        match tokio::fs::read(self.doc_path(id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StateError::Encoding {
                message: format!("corrupt document for {id}: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(StateError::backend(format!("read {id}: {e}"))),
        }
    }

    async fn store_doc(&self, id: &str, doc: &Map<String, Value>) -> Result<(), StateError> {
        let path = self.doc_path(id);
        let tmp = self.root.join(format!("{id}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| StateError::Encoding {
            message: e.to_string(),
        })?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StateError::backend(format!("write {id}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateError::backend(format!("rename {id}: {e}")))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, id: &str, key: &str) -> Result<Option<Value>, StateError> {
        check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        Ok(self.load_doc(id).await?.get(key).cloned())
    }

    async fn write(&self, id: &str, key: &str, value: Value) -> Result<(), StateError> {
        check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let mut doc = self.load_doc(id).await?;
        doc.insert(key.to_string(), value);
        self.store_doc(id, &doc).await
    }

    async fn remove(&self, id: &str, key: &str) -> Result<(), StateError> {
        check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let mut doc = self.load_doc(id).await?;
        if doc.remove(key).is_some() {
            self.store_doc(id, &doc).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, id: &str) -> Result<(), StateError> {
        check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.doc_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::backend(format!("delete {id}: {e}"))),
        }
    }

    async fn state_ids(&self) -> Result<Vec<String>, StateError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StateError::backend(format!("list state dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::backend(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn persists_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
            store.write("a", "k", json!({"n": 1})).await.unwrap();
        }
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.read("a", "k").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.state_ids().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn delete_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        store.write("a", "k", json!(1)).await.unwrap();
        store.delete_all("a").await.unwrap();
        store.delete_all("a").await.unwrap();
        assert!(store.state_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.write("../evil", "k", json!(1)).await.is_err());
    }
}
