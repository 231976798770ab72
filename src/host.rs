//! The agent host: the process-wide coordinator owning the instantiation
//! service, callback registry, scheduler, event bus, and transports, and
//! routing `receive`/`send` between them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::agent::{AgentContext, AgentHandle};
use crate::callbacks::{CallbackRegistry, PendingCall};
use crate::events::{EventBus, Subscription};
use crate::instantiation::{BootHandle, InstantiationService};
use crate::rpc::dispatch::{self, Authorizor};
use crate::rpc::registry::AgentRegistry;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::scheduler::TaskScheduler;
use crate::state::StateStore;
use crate::transport::Transport;
use crate::types::{AgentUrl, InstantiationError, Tag, TransportError};

/// Builtin operations resolved on every hosted agent.
const EVENT_SUBSCRIBE: &str = "event.subscribe";
const EVENT_UNSUBSCRIBE: &str = "event.unsubscribe";

/// Host construction options.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// State id reserved for the instantiation service itself.
    pub service_id: String,
    /// Deadline for synchronous `send`; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            service_id: "instantiation".to_string(),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Process-wide coordinator for a fleet of hosted agents.
pub struct AgentHost {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    instantiation: Arc<InstantiationService>,
    callbacks: Arc<CallbackRegistry>,
    scheduler: TaskScheduler,
    events: EventBus,
    transports: DashMap<String, Arc<dyn Transport>>,
    authorizors: DashMap<String, Arc<dyn Authorizor>>,
    base_url: RwLock<Option<String>>,
    request_timeout: Option<Duration>,
}

impl AgentHost {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        options: HostOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let instantiation = Arc::new(InstantiationService::new(
                store.clone(),
                registry.clone(),
                options.service_id.clone(),
            ));
            Self {
                scheduler: TaskScheduler::new(store.clone(), weak.clone()),
                events: EventBus::new(store.clone(), weak.clone()),
                store,
                registry,
                instantiation,
                callbacks: Arc::new(CallbackRegistry::new()),
                transports: DashMap::new(),
                authorizors: DashMap::new(),
                base_url: RwLock::new(None),
                request_timeout: options.request_timeout,
            }
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn instantiation(&self) -> &Arc<InstantiationService> {
        &self.instantiation
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an outbound transport under its scheme.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .insert(transport.scheme().to_string(), transport);
    }

    /// Attach an authorizor consulted before every invocation on `agent_id`.
    pub fn set_authorizor(&self, agent_id: &str, authorizor: Arc<dyn Authorizor>) {
        self.authorizors.insert(agent_id.to_string(), authorizor);
    }

    /// Record the externally visible base URL once a transport server is
    /// listening; local agents are then addressed through it.
    pub fn set_base_url(&self, base: String) {
        *self.base_url.write() = Some(base.trim_end_matches('/').to_string());
    }

    /// The canonical URL of a locally hosted agent.
    pub fn local_url(&self, agent_id: &str) -> String {
        match self.base_url.read().as_ref() {
            Some(base) => format!("{base}/agents/{agent_id}/"),
            None => format!("local:{agent_id}"),
        }
    }

    fn local_agent_id(&self, target: &AgentUrl) -> Option<String> {
        match target {
            AgentUrl::Local { id } => Some(id.clone()),
            AgentUrl::Http { raw, id } => {
                let base = self.base_url.read().clone()?;
                raw.starts_with(&base).then(|| id.clone())
            }
        }
    }

    /// Cold-start the persisted fleet. See `InstantiationService::boot`.
    pub async fn boot(self: &Arc<Self>, workers: usize) -> BootHandle {
        self.instantiation.boot(workers).await
    }

    /// Wake `agent_id` if needed and re-arm its persisted scheduled tasks.
    /// Failures are logged and yield `None`.
    pub async fn init_agent(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        match self.try_init_agent(agent_id).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "failed to wake agent");
                None
            }
        }
    }

    /// Like [`init_agent`], surfacing why the wake failed.
    ///
    /// [`init_agent`]: AgentHost::init_agent
    pub async fn try_init_agent(
        &self,
        agent_id: &str,
    ) -> Result<Arc<AgentHandle>, InstantiationError> {
        let handle = self.instantiation.try_init(agent_id, false).await?;
        if let Err(e) = self.scheduler.resume(agent_id).await {
            tracing::warn!(agent_id, error = %e, "failed to resume scheduled tasks");
        }
        Ok(handle)
    }

    /// Deliver `request` to the named agent and forward the produced
    /// response to whatever installed `tag`.
    pub async fn receive(
        self: &Arc<Self>,
        agent_id: &str,
        request: JsonRpcRequest,
        sender_url: Option<String>,
        tag: Tag,
    ) {
        let response = self.execute(agent_id, request, sender_url, false).await;
        self.callbacks.fulfill(&tag, response);
    }

    /// Synchronous outbound call.
    pub async fn send(
        self: &Arc<Self>,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        self.send_from(None, url, method, params).await
    }

    /// Outbound call returning the pending handle instead of blocking.
    pub async fn send_async(
        self: &Arc<Self>,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<PendingCall, RpcError> {
        self.send_async_from(None, url, method, params).await
    }

    pub(crate) async fn send_from(
        self: &Arc<Self>,
        current_agent: Option<&str>,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let target = AgentUrl::parse(url).map_err(|e| RpcError::transport(e.to_string()))?;
        let tag = Tag::fresh();
        let request = JsonRpcRequest::new(method, params).with_id(json!(tag.as_str()));

        if let Some(local_id) = self.local_agent_id(&target) {
            if current_agent == Some(local_id.as_str()) {
                // Same agent, same operation: the operation lock is already
                // held by this task, so dispatch inline.
                let sender = Some(self.local_url(&local_id));
                return self
                    .execute(&local_id, request, sender, true)
                    .await
                    .into_result();
            }
            let pending = self.callbacks.install(tag.clone());
            let sender = current_agent.map(|a| self.local_url(a));
            self.receive(&local_id, request, sender, tag).await;
            return pending.wait(self.request_timeout).await?.into_result();
        }

        let Some(transport) = self
            .transports
            .get(target.scheme())
            .map(|t| t.value().clone())
        else {
            let e = TransportError::UnknownScheme {
                scheme: target.scheme().to_string(),
            };
            return Err(RpcError::transport(e.to_string()));
        };
        let pending = self.callbacks.install(tag.clone());
        if let Err(e) = transport.send(&target, request, tag.clone()).await {
            self.callbacks.discard(&tag);
            return Err(RpcError::transport(e.to_string()));
        }
        pending.wait(self.request_timeout).await?.into_result()
    }

    pub(crate) async fn send_async_from(
        self: &Arc<Self>,
        current_agent: Option<&str>,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<PendingCall, RpcError> {
        let target = AgentUrl::parse(url).map_err(|e| RpcError::transport(e.to_string()))?;
        let tag = Tag::fresh();
        let request = JsonRpcRequest::new(method, params).with_id(json!(tag.as_str()));
        let pending = self.callbacks.install(tag.clone());

        if let Some(local_id) = self.local_agent_id(&target) {
            let host = self.clone();
            let sender = current_agent.map(|a| self.local_url(a));
            tokio::spawn(async move {
                host.receive(&local_id, request, sender, tag).await;
            });
            return Ok(pending);
        }

        let Some(transport) = self
            .transports
            .get(target.scheme())
            .map(|t| t.value().clone())
        else {
            self.callbacks.discard(&tag);
            let e = TransportError::UnknownScheme {
                scheme: target.scheme().to_string(),
            };
            return Err(RpcError::transport(e.to_string()));
        };
        if let Err(e) = transport.send(&target, request, tag.clone()).await {
            self.callbacks.discard(&tag);
            return Err(RpcError::transport(e.to_string()));
        }
        Ok(pending)
    }

    async fn execute(
        self: &Arc<Self>,
        agent_id: &str,
        request: JsonRpcRequest,
        sender_url: Option<String>,
        inline: bool,
    ) -> JsonRpcResponse {
        let id = request.id.clone();

        let handle = match self.try_init_agent(agent_id).await {
            Ok(handle) => handle,
            Err(InstantiationError::NotRegistered { .. }) => {
                return JsonRpcResponse::failure(
                    id,
                    RpcError::not_found(format!("unknown agent: {agent_id}")),
                );
            }
            // Class missing or construction failed: the entry stays
            // registered and the caller sees an internal error.
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "failed to wake agent for request");
                return JsonRpcResponse::failure(id, RpcError::internal(e.to_string()));
            }
        };

        let _guard = if inline {
            None
        } else {
            Some(handle.lock_op().await)
        };

        let Some(agent) = handle.current() else {
            return JsonRpcResponse::failure(
                id,
                RpcError::internal(format!("agent {agent_id} was released")),
            );
        };

        let authorizor = self
            .authorizors
            .get(agent_id)
            .map(|entry| entry.value().clone());

        if request.method == EVENT_SUBSCRIBE || request.method == EVENT_UNSUBSCRIBE {
            if let Some(authorizor) = &authorizor {
                if !authorizor.authorize(&request.method, sender_url.as_deref()) {
                    return JsonRpcResponse::failure(
                        id,
                        RpcError::not_authorized(&request.method),
                    );
                }
            }
            return self.event_builtin(agent_id, &request).await;
        }

        let Some(table) = self.registry.table(agent.class_name()) else {
            return JsonRpcResponse::failure(
                id,
                RpcError::internal(format!(
                    "no dispatch table for class {}",
                    agent.class_name()
                )),
            );
        };

        let ctx = AgentContext::new(self, agent_id.to_string(), sender_url);
        dispatch::dispatch(&table, agent, ctx, authorizor.as_ref(), &request).await
    }

    async fn event_builtin(&self, agent_id: &str, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let subscription: Subscription = match serde_json::from_value(request.params.clone()) {
            Ok(s) => s,
            Err(e) => {
                return JsonRpcResponse::failure(id, RpcError::invalid_params(e.to_string()));
            }
        };
        let outcome = if request.method == EVENT_SUBSCRIBE {
            self.events.add_subscription(agent_id, subscription).await
        } else {
            self.events
                .remove_subscription(agent_id, &subscription)
                .await
        };
        match outcome {
            Ok(()) => JsonRpcResponse::success(id, Value::Null),
            Err(e) => JsonRpcResponse::failure(id, RpcError::internal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentClass;
    use crate::demo::EchoAgent;
    use crate::rpc::code;
    use crate::rpc::dispatch::MethodAllowList;
    use crate::state::MemoryStateStore;
    use serde_json::json;

    async fn host_with_agents(ids: &[&str]) -> Arc<AgentHost> {
        let registry = Arc::new(AgentRegistry::new());
        registry.register::<EchoAgent>();
        let host = AgentHost::new(
            Arc::new(MemoryStateStore::new()),
            registry,
            HostOptions::default(),
        );
        for id in ids {
            host.instantiation()
                .register(id, EchoAgent::CLASS_NAME, json!({}))
                .await
                .unwrap();
        }
        host
    }

    #[tokio::test]
    async fn receive_routes_the_response_to_the_tag() {
        let host = host_with_agents(&["a"]).await;
        let tag = Tag::fresh();
        let pending = host.callbacks().install(tag.clone());

        let request =
            JsonRpcRequest::new("ping", json!({"message": "hi"})).with_id(json!(1));
        host.receive("a", request, None, tag).await;

        let response = pending.wait(None).await.unwrap();
        assert_eq!(response.result, Some(json!("hi")));
        assert_eq!(response.id, Some(json!(1)));
    }

    #[tokio::test]
    async fn missing_required_param_fails_the_call() {
        let host = host_with_agents(&["a"]).await;
        let tag = Tag::fresh();
        let pending = host.callbacks().install(tag.clone());

        let request = JsonRpcRequest::new("ping", json!({})).with_id(json!(2));
        host.receive("a", request, None, tag).await;

        let response = pending.wait(None).await.unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, code::INVALID_PARAMS);
        assert_eq!(response.id, Some(json!(2)));
    }

    #[tokio::test]
    async fn unknown_agent_yields_not_found() {
        let host = host_with_agents(&[]).await;
        let tag = Tag::fresh();
        let pending = host.callbacks().install(tag.clone());

        host.receive("ghost", JsonRpcRequest::new("ping", json!({})), None, tag)
            .await;

        let error = pending.wait(None).await.unwrap().error.unwrap();
        assert_eq!(error.code, code::NOT_FOUND);
    }

    #[tokio::test]
    async fn unregistered_class_maps_to_internal_error() {
        let host = host_with_agents(&[]).await;
        host.instantiation()
            .register("a", "Mystery", json!({}))
            .await
            .unwrap();

        let err = host
            .send("local:a", "ping", json!({"message": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INTERNAL_ERROR);
        assert!(err.message.contains("Mystery"));
        // The entry survives for a later retry.
        assert!(host.instantiation().exists("a"));
    }

    #[tokio::test]
    async fn unhandled_scheme_fails_the_send() {
        let host = host_with_agents(&[]).await;
        let err = host
            .send("http://elsewhere/agents/x/", "ping", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::TRANSPORT);
        assert!(err.message.contains("http"));
    }

    #[tokio::test]
    async fn undialable_endpoint_fails_the_send_synchronously() {
        let host = host_with_agents(&[]).await;
        host.register_transport(Arc::new(crate::transport::HttpTransport::new(
            host.callbacks().clone(),
        )));

        // Parses as an agent URL but is not something the client can dial.
        let err = host
            .send("http://bad host:9/agents/x/", "ping", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::TRANSPORT);
        // The pending entry was discarded, not leaked.
        assert_eq!(host.callbacks().pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let host = host_with_agents(&["a"]).await;
        let result = host.send("local:a", "no_such_method", json!({})).await;
        assert_eq!(result.unwrap_err().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn send_reaches_a_local_agent() {
        let host = host_with_agents(&["a"]).await;
        let result = host
            .send("local:a", "ping", json!({"message": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[tokio::test]
    async fn cascade_sees_its_own_self_send() {
        let host = host_with_agents(&["a"]).await;
        let result = host.send("local:a", "cascade", json!({})).await.unwrap();
        assert_eq!(result, json!("42"));
    }

    #[tokio::test]
    async fn agents_call_each_other() {
        let host = host_with_agents(&["a", "b"]).await;
        let result = host
            .send(
                "local:a",
                "call_peer",
                json!({"url": "local:b", "method": "ping", "params": {"message": "relay"}}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!("relay"));
    }

    #[tokio::test]
    async fn authorizor_rejections_map_to_not_authorized() {
        let host = host_with_agents(&["a"]).await;
        host.set_authorizor("a", Arc::new(MethodAllowList::new(vec!["ping".to_string()])));

        let ok = host
            .send("local:a", "ping", json!({"message": "x"}))
            .await
            .unwrap();
        assert_eq!(ok, json!("x"));

        let err = host.send("local:a", "cascade", json!({})).await.unwrap_err();
        assert_eq!(err.code, code::NOT_AUTHORIZED);
    }

    #[tokio::test]
    async fn void_operations_answer_null() {
        let host = host_with_agents(&["a"]).await;
        let result = host
            .send("local:a", "put", json!({"key": "k", "value": 7}))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn raw_params_receive_the_whole_object() {
        let host = host_with_agents(&["a"]).await;
        let result = host
            .send("local:a", "print_params", json!({"x": 1, "y": 2, "z": 3}))
            .await
            .unwrap();
        assert_eq!(result, json!("fields: 3"));
    }

    #[tokio::test]
    async fn domain_errors_pass_through_and_others_map_to_internal() {
        let host = host_with_agents(&["a"]).await;

        let err = host.send("local:a", "fail_not_found", json!({})).await.unwrap_err();
        assert_eq!(err.code, code::NOT_FOUND);

        let err = host.send("local:a", "fail", json!({})).await.unwrap_err();
        assert_eq!(err.code, code::INTERNAL_ERROR);
        assert!(err.message.contains("went wrong"));
    }
}
