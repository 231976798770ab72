//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use apiary::demo::EchoAgent;
use apiary::{AgentClass, AgentHost, AgentRegistry, HostOptions, MemoryStateStore, StateStore};

/// A registry knowing only the demo agent.
pub fn demo_registry() -> Arc<AgentRegistry> {
    let registry = Arc::new(AgentRegistry::new());
    registry.register::<EchoAgent>();
    registry
}

/// A memory-backed host with the given agents registered.
pub async fn host_with_agents(ids: &[&str]) -> Arc<AgentHost> {
    host_on_store(Arc::new(MemoryStateStore::new()), ids).await
}

/// A host over an explicit store, for restart-style tests.
pub async fn host_on_store(store: Arc<dyn StateStore>, ids: &[&str]) -> Arc<AgentHost> {
    let host = AgentHost::new(store, demo_registry(), HostOptions::default());
    for id in ids {
        host.instantiation()
            .register(id, EchoAgent::CLASS_NAME, json!({}))
            .await
            .unwrap();
    }
    host
}
