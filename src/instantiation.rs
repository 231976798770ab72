//! Lazy agent lifecycle: registration, wake-on-demand, and the two-phase
//! cold boot that brings a persisted fleet back up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentHandle};
use crate::rpc::registry::AgentRegistry;
use crate::state::StateStore;
use crate::types::{InstantiationError, StateError};

/// Group agents wake before the rest so their members find them up.
const GROUP_AGENT_SUFFIX: &str = "_groupAgent";

/// Always woken synchronously when present.
const REST_AGENT_KEY: &str = "restagent";

/// Messaging-style agents wake last; their publishers must be up first.
const SECOND_ROUND_PREFIXES: [&str; 2] = ["notificationAgent_", "messageAgent_"];

/// State key holding the persistent record of a registered agent.
const ENTRY_KEY: &str = "entry";

/// The persistent descriptor of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantiationEntry {
    pub key: String,
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip)]
    pub handler: Option<Arc<AgentHandle>>,
}

type EntrySlot = Arc<Mutex<Option<InstantiationEntry>>>;

/// Registers, persists, wakes, and releases agents by key.
pub struct InstantiationService {
    service_id: String,
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    entries: DashMap<String, EntrySlot>,
}

/// Result of `boot()`: the synchronous phase is done, the deferred phase
/// runs in the background and can be awaited through `deferred`.
pub struct BootHandle {
    pub priority_woken: usize,
    pub deferred: JoinHandle<DeferredStats>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeferredStats {
    pub woken: usize,
    pub skipped: usize,
}

impl InstantiationService {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            store,
            registry,
            entries: DashMap::new(),
        }
    }

    /// Re-enumerate the backend and make every persisted id known. The
    /// service's own state id is not an agent.
    pub async fn load(&self) -> Result<(), StateError> {
        for id in self.store.state_ids().await? {
            if id == self.service_id {
                continue;
            }
            self.entries
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(None)));
        }
        Ok(())
    }

    /// Persist an entry for `key`, overwriting any existing record. No live
    /// instance is created.
    pub async fn register(
        &self,
        key: &str,
        class_name: &str,
        params: Value,
    ) -> Result<(), StateError> {
        let slot = self.slot_for(key);
        let mut guard = slot.lock().await;
        // A live instance survives re-registration; only the persisted
        // record is rewritten.
        let handler = guard.as_ref().and_then(|e| e.handler.clone());
        let entry = InstantiationEntry {
            key: key.to_string(),
            class_name: class_name.to_string(),
            params,
            handler,
        };
        self.store_entry(&entry).await?;
        *guard = Some(entry);
        Ok(())
    }

    /// Remove the entry and its backing per-key state. Idempotent.
    pub async fn deregister(&self, key: &str) -> Result<(), StateError> {
        if let Some((_, slot)) = self.entries.remove(key) {
            let guard = slot.lock().await;
            if let Some(handle) = guard.as_ref().and_then(|e| e.handler.as_ref()) {
                handle.clear();
            }
        }
        self.store.delete_all(key).await
    }

    /// True iff an entry record exists for `key`, awake or not.
    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// True iff a live instance currently backs `key`.
    pub fn is_awake(&self, key: &str) -> bool {
        let Some(slot) = self.entries.get(key).map(|s| s.value().clone()) else {
            return false;
        };
        let result = match slot.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .and_then(|e| e.handler.as_ref())
                .map(|h| h.is_live())
                .unwrap_or(false),
            Err(_) => false,
        };
        result
    }

    pub fn known_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Discard the live instance for `key`; persisted data stays intact and
    /// existing handles retarget on the next `init`.
    pub async fn release(&self, key: &str) {
        if let Some(slot) = self.entries.get(key).map(|s| s.value().clone()) {
            let guard = slot.lock().await;
            if let Some(handle) = guard.as_ref().and_then(|e| e.handler.as_ref()) {
                handle.clear();
                tracing::debug!(key, "released agent instance");
            }
        }
    }

    /// Return the live handle for `key`, instantiating if necessary.
    /// Failures are logged and yield `None`; the entry stays registered for
    /// a later retry.
    pub async fn init(&self, key: &str, on_boot: bool) -> Option<Arc<AgentHandle>> {
        match self.try_init(key, on_boot).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to wake agent");
                None
            }
        }
    }

    /// Like [`init`], surfacing the failure instead of logging it.
    ///
    /// Concurrent calls for the same key serialize on the entry slot, so at
    /// most one instantiation happens and later callers observe its result.
    /// Failures never poison the entry table.
    ///
    /// [`init`]: InstantiationService::init
    pub async fn try_init(
        &self,
        key: &str,
        on_boot: bool,
    ) -> Result<Arc<AgentHandle>, InstantiationError> {
        let slot = match self.entries.get(key).map(|s| s.value().clone()) {
            Some(slot) => slot,
            None => {
                // Not known in memory; the record may still exist in the
                // backend (written by an earlier process).
                let Some(record) = self.load_entry(key).await? else {
                    return Err(InstantiationError::NotRegistered {
                        key: key.to_string(),
                    });
                };
                let slot = self.slot_for(key);
                let mut guard = slot.lock().await;
                if guard.is_none() {
                    *guard = Some(record);
                }
                drop(guard);
                slot
            }
        };

        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.load_entry(key).await?;
        }
        let Some(entry) = guard.as_mut() else {
            return Err(InstantiationError::NotRegistered {
                key: key.to_string(),
            });
        };

        if let Some(handle) = &entry.handler {
            if handle.is_live() {
                return Ok(handle.clone());
            }
        }

        tracing::debug!(key, on_boot, class = %entry.class_name, "instantiating agent");
        let Some(mut instance) = self.registry.construct(&entry.class_name) else {
            return Err(InstantiationError::UnknownClass {
                class: entry.class_name.clone(),
            });
        };
        instance.set_config(entry.params.clone());
        let agent: Arc<dyn Agent> = Arc::from(instance);

        let handle = match &entry.handler {
            // A stale handle retargets so references held by callers see the
            // fresh instance.
            Some(stale) => {
                stale.retarget(agent);
                stale.clone()
            }
            None => {
                let handle = Arc::new(AgentHandle::new(agent));
                entry.handler = Some(handle.clone());
                handle
            }
        };

        if let Err(e) = self.store_entry(entry).await {
            tracing::warn!(key, error = %e, "failed to persist instantiation entry");
        }
        Ok(handle)
    }

    /// Two-phase cold start.
    ///
    /// Phase A wakes the priority set synchronously: every `_groupAgent`
    /// entry whose stripped prefix is also registered (both ids), plus the
    /// well-known `restagent`. Phase B wakes everything else on a bounded
    /// worker pool, deferring messaging-prefixed ids to a second round.
    pub async fn boot(self: &Arc<Self>, workers: usize) -> BootHandle {
        if let Err(e) = self.load().await {
            tracing::warn!(error = %e, "failed to enumerate persisted entries");
        }

        let keys = self.known_keys();
        let mut priority: HashSet<String> = HashSet::new();
        priority.insert(REST_AGENT_KEY.to_string());
        for key in &keys {
            if let Some(prefix) = key.strip_suffix(GROUP_AGENT_SUFFIX) {
                if !prefix.is_empty() && self.exists(prefix) {
                    priority.insert(prefix.to_string());
                    priority.insert(key.clone());
                }
            }
        }

        let mut woken = 0usize;
        for key in &priority {
            if self.init(key, true).await.is_some() {
                woken += 1;
            }
        }
        tracing::info!(woken, priority = priority.len(), "priority boot complete");

        let service = self.clone();
        let workers = workers.max(1);
        let deferred =
            tokio::spawn(async move { service.deferred_boot(priority, workers).await });
        BootHandle {
            priority_woken: woken,
            deferred,
        }
    }

    async fn deferred_boot(
        self: Arc<Self>,
        exclude: HashSet<String>,
        workers: usize,
    ) -> DeferredStats {
        let mut round1 = Vec::new();
        let mut round2 = Vec::new();
        let mut skipped = 0usize;

        for key in self.known_keys() {
            if exclude.contains(&key) {
                skipped += 1;
                continue;
            }
            if key.is_empty() || key.contains('{') {
                tracing::warn!(%key, "not booting agent with suspicious id");
                skipped += 1;
                continue;
            }
            if SECOND_ROUND_PREFIXES.iter().any(|p| key.starts_with(p)) {
                round2.push(key);
            } else {
                round1.push(key);
            }
        }

        tracing::info!(
            round1 = round1.len(),
            round2 = round2.len(),
            "deferred boot starting"
        );

        let woken = Arc::new(AtomicUsize::new(0));
        for (round, keys) in [(1usize, round1), (2, round2)] {
            let total = keys.len();
            futures::stream::iter(keys)
                .for_each_concurrent(workers, |key| {
                    let service = self.clone();
                    let woken = woken.clone();
                    async move {
                        if service.is_awake(&key) {
                            return;
                        }
                        if service.init(&key, true).await.is_some() {
                            let booted = woken.fetch_add(1, Ordering::Relaxed) + 1;
                            if booted % 100 == 0 {
                                tracing::info!(booted, "deferred boot progress");
                            }
                        }
                    }
                })
                .await;
            tracing::info!(round, total, "deferred boot round complete");
        }

        DeferredStats {
            woken: woken.load(Ordering::Relaxed),
            skipped,
        }
    }

    /// Tear down the whole service: every per-key state plus the service's
    /// own.
    pub async fn delete(&self) -> Result<(), StateError> {
        for key in self.known_keys() {
            self.store.delete_all(&key).await?;
        }
        self.store.delete_all(&self.service_id).await?;
        self.entries.clear();
        Ok(())
    }

    fn slot_for(&self, key: &str) -> EntrySlot {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    async fn load_entry(
        &self,
        key: &str,
    ) -> Result<Option<InstantiationEntry>, InstantiationError> {
        match self.store.read(key, ENTRY_KEY).await? {
            Some(value) => {
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| InstantiationError::Construction {
                        key: key.to_string(),
                        message: format!("corrupt entry record: {e}"),
                    })
            }
            None => Ok(None),
        }
    }

    async fn store_entry(&self, entry: &InstantiationEntry) -> Result<(), StateError> {
        let value = serde_json::to_value(entry).map_err(|e| StateError::Encoding {
            message: e.to_string(),
        })?;
        self.store.write(&entry.key, ENTRY_KEY, value).await
    }
}
