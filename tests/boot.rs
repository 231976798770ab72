//! Cold-boot scenarios over a real file backend.

mod common;

use std::sync::Arc;

use serde_json::json;

use apiary::demo::EchoAgent;
use apiary::{AgentClass, FileStateStore, StateStore};

#[tokio::test]
async fn boot_priority_partition_ends_with_everyone_awake() {
    let dir = tempfile::tempdir().unwrap();

    // A previous run registered five agents.
    {
        let store: Arc<dyn StateStore> =
            Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
        let host = common::host_on_store(store, &[]).await;
        for key in ["restagent", "foo_groupAgent", "foo", "notificationAgent_1", "bar"] {
            host.instantiation()
                .register(key, EchoAgent::CLASS_NAME, json!({}))
                .await
                .unwrap();
        }
    }

    // A fresh process boots from the same directory.
    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
    let host = common::host_on_store(store, &[]).await;
    let boot = host.boot(2).await;

    // Phase A: the priority set is awake before the deferred phase runs.
    assert_eq!(boot.priority_woken, 3);
    for key in ["restagent", "foo", "foo_groupAgent"] {
        assert!(
            host.instantiation().is_awake(key),
            "{key} should wake in phase A"
        );
    }

    let stats = boot.deferred.await.unwrap();
    assert_eq!(stats.woken, 2);
    for key in ["restagent", "foo", "foo_groupAgent", "bar", "notificationAgent_1"] {
        assert!(host.instantiation().is_awake(key), "{key} should be awake");
    }
}

#[tokio::test]
async fn config_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = json!({"name": "keeper", "limit": 9});

    {
        let store: Arc<dyn StateStore> =
            Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
        let host = common::host_on_store(store, &[]).await;
        host.instantiation()
            .register("keeper", EchoAgent::CLASS_NAME, config.clone())
            .await
            .unwrap();
    }

    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
    let host = common::host_on_store(store, &[]).await;
    host.instantiation().load().await.unwrap();

    let handle = host.init_agent("keeper").await.unwrap();
    assert_eq!(handle.current().unwrap().config(), config);
}

#[tokio::test]
async fn agent_state_survives_release_and_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store: Arc<dyn StateStore> =
            Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
        let host = common::host_on_store(store, &["a"]).await;
        host.send("local:a", "put", json!({"key": "color", "value": "teal"}))
            .await
            .unwrap();
        host.instantiation().release("a").await;
        assert!(!host.instantiation().is_awake("a"));

        // Release loses nothing: the next call wakes the agent again.
        let value = host
            .send("local:a", "get", json!({"key": "color"}))
            .await
            .unwrap();
        assert_eq!(value, json!("teal"));
    }

    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
    let host = common::host_on_store(store, &[]).await;
    host.instantiation().load().await.unwrap();
    let value = host
        .send("local:a", "get", json!({"key": "color"}))
        .await
        .unwrap();
    assert_eq!(value, json!("teal"));
}

#[tokio::test]
async fn deregistration_removes_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(dir.path().to_path_buf()).unwrap());
    let host = common::host_on_store(store.clone(), &["a"]).await;

    host.send("local:a", "put", json!({"key": "k", "value": 1}))
        .await
        .unwrap();
    host.instantiation().deregister("a").await.unwrap();

    assert!(!host.instantiation().exists("a"));
    assert!(store.state_ids().await.unwrap().is_empty());
}
