//! Scheduled self-RPC scenarios.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

#[tokio::test]
async fn a_scheduled_task_fires_after_its_delay() {
    let host = common::host_with_agents(&["a"]).await;

    host.send("local:a", "create_task", json!({"delay": 300}))
        .await
        .unwrap();

    // Nothing before the deadline.
    let early = host
        .send("local:a", "get", json!({"key": "last_task_message"}))
        .await
        .unwrap();
    assert_eq!(early, Value::Null);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let message = host
        .send("local:a", "get", json!({"key": "last_task_message"}))
        .await
        .unwrap();
    assert_eq!(message, json!("hello world"));
}

#[tokio::test]
async fn cancel_before_the_deadline_suppresses_the_task() {
    let host = common::host_with_agents(&["a"]).await;

    let id = host
        .send("local:a", "create_task", json!({"delay": 300}))
        .await
        .unwrap();
    host.send("local:a", "cancel_task", json!({"id": id}))
        .await
        .unwrap();
    // Canceling again is fine.
    host.send("local:a", "cancel_task", json!({"id": id}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let message = host
        .send("local:a", "get", json!({"key": "last_task_message"}))
        .await
        .unwrap();
    assert_eq!(message, Value::Null);
}

#[tokio::test]
async fn equal_delay_tasks_fire_in_creation_order() {
    let host = common::host_with_agents(&["a"]).await;

    host.send(
        "local:a",
        "schedule_note",
        json!({"message": "first", "delay": 150}),
    )
    .await
    .unwrap();
    host.send(
        "local:a",
        "schedule_note",
        json!({"message": "second", "delay": 150}),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let log = host
        .send("local:a", "get", json!({"key": "task_log"}))
        .await
        .unwrap();
    assert_eq!(log, json!(["first", "second"]));
}

#[tokio::test]
async fn persisted_tasks_rearm_on_wake() {
    let store: std::sync::Arc<dyn apiary::StateStore> =
        std::sync::Arc::new(apiary::MemoryStateStore::new());

    {
        let host = common::host_on_store(store.clone(), &["a"]).await;
        // Schedule far in the future so it is still pending at "restart".
        host.send(
            "local:a",
            "schedule_note",
            json!({"message": "survivor", "delay": 250}),
        )
        .await
        .unwrap();
        host.instantiation().release("a").await;
    }

    // A new host over the same backend: waking the agent re-arms the task.
    let host = common::host_on_store(store, &[]).await;
    host.instantiation().load().await.unwrap();
    assert!(host.init_agent("a").await.is_some());

    tokio::time::sleep(Duration::from_millis(700)).await;
    let log = host
        .send("local:a", "get", json!({"key": "task_log"}))
        .await
        .unwrap();
    assert_eq!(log, json!(["survivor"]));
}
