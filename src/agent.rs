//! The agent model: the `Agent` trait, the retargetable handle callers hold
//! across wake/release cycles, and the per-invocation context through which
//! operations reach state, peers, events, and the scheduler.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::callbacks::PendingCall;
use crate::host::AgentHost;
use crate::rpc::dispatch::MethodTable;
use crate::rpc::{JsonRpcRequest, RpcError};
use crate::types::{SchedulerError, StateError};

/// A hosted agent instance.
///
/// Implementations are constructed with a nullary constructor (`Default` via
/// [`AgentClass`]), receive their persisted params through `set_config`
/// before going live, and expose operations through the class's
/// [`MethodTable`].
pub trait Agent: Send + Sync + 'static {
    /// The class tag stored in instantiation entries.
    fn class_name(&self) -> &'static str;

    /// Inject the persisted config. Called once, before the instance is
    /// shared.
    fn set_config(&mut self, config: Value);

    /// The config this instance was created with.
    fn config(&self) -> Value;

    /// Upcast for dispatch-table invokers.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A registrable agent class: nullary construction plus a dispatch table.
pub trait AgentClass: Agent + Default {
    const CLASS_NAME: &'static str;

    /// Build the class's dispatch table. Called once per process; the result
    /// is cached by the registry.
    fn methods() -> MethodTable;
}

/// Stable reference through which callers address an agent across
/// wake/release cycles.
///
/// The handle outlives the instance it points at: releasing the agent clears
/// the inner slot, re-initialization retargets it, and anyone still holding
/// the handle transparently sees the new instance.
pub struct AgentHandle {
    inner: RwLock<Option<Arc<dyn Agent>>>,
    op_lock: Mutex<()>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("is_live", &self.is_live())
            .finish()
    }
}

impl AgentHandle {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            inner: RwLock::new(Some(agent)),
            op_lock: Mutex::new(()),
        }
    }

    /// The live instance, if the agent is awake.
    pub fn current(&self) -> Option<Arc<dyn Agent>> {
        self.inner.read().clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Point the handle at a fresh instance.
    pub(crate) fn retarget(&self, agent: Arc<dyn Agent>) {
        *self.inner.write() = Some(agent);
    }

    /// Drop the live instance; the handle stays valid for re-init.
    pub(crate) fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Acquire the per-agent operation lock. Only one operation executes on
    /// a given agent at a time; the guard is held for the whole dispatch.
    pub(crate) async fn lock_op(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }
}

/// Per-invocation context handed to every operation.
#[derive(Clone)]
pub struct AgentContext {
    host: Weak<AgentHost>,
    pub agent_id: String,
    pub sender_url: Option<String>,
}

impl AgentContext {
    pub(crate) fn new(host: &Arc<AgentHost>, agent_id: String, sender_url: Option<String>) -> Self {
        Self {
            host: Arc::downgrade(host),
            agent_id,
            sender_url,
        }
    }

    /// A context not attached to a host; host-reaching calls fail. Meant for
    /// exercising dispatch tables in isolation.
    pub fn detached(agent_id: impl Into<String>) -> Self {
        Self {
            host: Weak::new(),
            agent_id: agent_id.into(),
            sender_url: None,
        }
    }

    fn host(&self) -> Result<Arc<AgentHost>, RpcError> {
        self.host
            .upgrade()
            .ok_or_else(|| RpcError::internal("agent host is gone"))
    }

    fn host_state(&self) -> Result<Arc<AgentHost>, StateError> {
        self.host
            .upgrade()
            .ok_or_else(|| StateError::backend("agent host is gone"))
    }

    /// The canonical URL under which this agent is addressable.
    pub fn url(&self) -> String {
        match self.host.upgrade() {
            Some(host) => host.local_url(&self.agent_id),
            None => format!("local:{}", self.agent_id),
        }
    }

    /// Read a key from this agent's persistent state.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        self.host_state()?.store().read(&self.agent_id, key).await
    }

    /// Write a key to this agent's persistent state.
    pub async fn put(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.host_state()?
            .store()
            .write(&self.agent_id, key, value)
            .await
    }

    /// Remove a key from this agent's persistent state.
    pub async fn remove(&self, key: &str) -> Result<(), StateError> {
        self.host_state()?.store().remove(&self.agent_id, key).await
    }

    /// Synchronous outbound call: blocks until the peer answers or the
    /// host's request deadline elapses.
    pub async fn send(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        self.host()?
            .send_from(Some(&self.agent_id), url, method, params)
            .await
    }

    /// Like [`send`], coercing the JSON result into `T`.
    ///
    /// [`send`]: AgentContext::send
    pub async fn send_as<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let value = self.send(url, method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::internal(format!("cannot coerce result: {e}")))
    }

    /// Outbound call returning the pending handle instead of blocking.
    pub async fn send_async(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<PendingCall, RpcError> {
        self.host()?
            .send_async_from(Some(&self.agent_id), url, method, params)
            .await
    }

    /// Fan out an event to this agent's subscribers.
    pub async fn trigger(&self, event: &str, params: Value) -> Result<usize, StateError> {
        let host = self.host_state()?;
        host.events()
            .trigger(&self.agent_id, self.url(), event, params)
            .await
    }

    /// Subscribe this agent to an event on a publisher.
    pub async fn subscribe(
        &self,
        publisher_url: &str,
        event: &str,
        callback: &str,
    ) -> Result<(), RpcError> {
        self.send(
            publisher_url,
            "event.subscribe",
            serde_json::json!({
                "url": self.url(),
                "event": event,
                "callback": callback,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Remove a subscription previously added with [`subscribe`].
    ///
    /// [`subscribe`]: AgentContext::subscribe
    pub async fn unsubscribe(
        &self,
        publisher_url: &str,
        event: &str,
        callback: &str,
    ) -> Result<(), RpcError> {
        self.send(
            publisher_url,
            "event.unsubscribe",
            serde_json::json!({
                "url": self.url(),
                "event": event,
                "callback": callback,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Schedule `request` to be dispatched back to this agent after `delay`.
    pub async fn create_task(
        &self,
        request: JsonRpcRequest,
        delay: Duration,
    ) -> Result<String, SchedulerError> {
        let host = self.host.upgrade().ok_or_else(|| SchedulerError::State(
            StateError::backend("agent host is gone"),
        ))?;
        host.scheduler()
            .create_task(&self.agent_id, request, delay)
            .await
    }

    /// Cancel a scheduled task by id. Idempotent.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let host = self.host.upgrade().ok_or_else(|| SchedulerError::State(
            StateError::backend("agent host is gone"),
        ))?;
        host.scheduler().cancel_task(&self.agent_id, task_id).await
    }
}
