//! Delayed, cancelable tasks issued by an agent to itself.
//!
//! Each agent gets a lane: one worker task owning an ordered queue. Firing a
//! task removes its persisted record first, then synthesizes a local receive
//! with a fresh tag, so the response is dropped on the floor by design of
//! the callback registry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::host::AgentHost;
use crate::rpc::JsonRpcRequest;
use crate::state::StateStore;
use crate::types::{SchedulerError, StateError, Tag};

/// State key holding an agent's scheduled tasks.
const TASKS_KEY: &str = "tasks";

/// A persisted scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Due time in unix milliseconds.
    pub due: i64,
    pub request: JsonRpcRequest,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskDoc {
    tasks: Vec<ScheduledTask>,
}

struct ArmedTask {
    due: i64,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for ArmedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ArmedTask {}

impl PartialOrd for ArmedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArmedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

enum LaneCmd {
    Arm(ArmedTask),
    Cancel(String),
}

struct SchedulerInner {
    store: Arc<dyn StateStore>,
    host: Weak<AgentHost>,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Per-agent delayed task queues.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    lanes: DashMap<String, mpsc::UnboundedSender<LaneCmd>>,
    seq: AtomicU64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn StateStore>, host: Weak<AgentHost>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                host,
                doc_locks: DashMap::new(),
            }),
            lanes: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedule `request` to be dispatched to `agent_id` after `delay`.
    /// Returns the task id, already persisted in the agent's state.
    pub async fn create_task(
        &self,
        agent_id: &str,
        request: JsonRpcRequest,
        delay: Duration,
    ) -> Result<String, SchedulerError> {
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            due: now_ms() + delay.as_millis() as i64,
            request,
        };

        {
            let lock = self.inner.doc_lock(agent_id);
            let _guard = lock.lock().await;
            let mut doc = self.inner.read_doc(agent_id).await?;
            doc.tasks.push(task.clone());
            self.inner.write_doc(agent_id, &doc).await?;
        }

        let id = task.id.clone();
        self.arm(agent_id, task)?;
        tracing::debug!(agent_id, task_id = %id, "scheduled task");
        Ok(id)
    }

    /// Cancel a task by id. Canceling an unknown or already-fired id is a
    /// no-op.
    pub async fn cancel_task(&self, agent_id: &str, task_id: &str) -> Result<(), SchedulerError> {
        {
            let lock = self.inner.doc_lock(agent_id);
            let _guard = lock.lock().await;
            let mut doc = self.inner.read_doc(agent_id).await?;
            let before = doc.tasks.len();
            doc.tasks.retain(|t| t.id != task_id);
            if doc.tasks.len() != before {
                self.inner.write_doc(agent_id, &doc).await?;
            }
        }

        if let Some(lane) = self.lanes.get(agent_id) {
            let _ = lane.send(LaneCmd::Cancel(task_id.to_string()));
        }
        Ok(())
    }

    /// Re-arm persisted tasks after a wake. Past-due tasks fire immediately
    /// in undefined mutual order; future tasks wait out their remaining
    /// delay. Idempotent per lane.
    pub async fn resume(&self, agent_id: &str) -> Result<(), SchedulerError> {
        if self.lanes.contains_key(agent_id) {
            return Ok(());
        }
        let doc = self.inner.read_doc(agent_id).await?;
        if doc.tasks.is_empty() {
            return Ok(());
        }
        tracing::debug!(agent_id, count = doc.tasks.len(), "re-arming persisted tasks");
        for task in doc.tasks {
            self.arm(agent_id, task)?;
        }
        Ok(())
    }

    fn arm(&self, agent_id: &str, task: ScheduledTask) -> Result<(), SchedulerError> {
        let armed = ArmedTask {
            due: task.due,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        let lane = self
            .lanes
            .entry(agent_id.to_string())
            .or_insert_with(|| spawn_lane(agent_id.to_string(), self.inner.clone()))
            .clone();
        lane.send(LaneCmd::Arm(armed))
            .map_err(|_| SchedulerError::LaneClosed {
                agent_id: agent_id.to_string(),
            })
    }
}

impl SchedulerInner {
    fn doc_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.doc_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_doc(&self, agent_id: &str) -> Result<TaskDoc, StateError> {
        match self.store.read(agent_id, TASKS_KEY).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| StateError::Encoding {
                message: format!("corrupt task document for {agent_id}: {e}"),
            }),
            None => Ok(TaskDoc::default()),
        }
    }

    async fn write_doc(&self, agent_id: &str, doc: &TaskDoc) -> Result<(), StateError> {
        let value = serde_json::to_value(doc).map_err(|e| StateError::Encoding {
            message: e.to_string(),
        })?;
        self.store.write(agent_id, TASKS_KEY, value).await
    }

    /// Remove the persisted record of a task that is about to fire.
    async fn consume_task(&self, agent_id: &str, task_id: &str) {
        let lock = self.doc_lock(agent_id);
        let _guard = lock.lock().await;
        match self.read_doc(agent_id).await {
            Ok(mut doc) => {
                doc.tasks.retain(|t| t.id != task_id);
                if let Err(e) = self.write_doc(agent_id, &doc).await {
                    tracing::warn!(agent_id, task_id, error = %e, "failed to consume task");
                }
            }
            Err(e) => {
                tracing::warn!(agent_id, task_id, error = %e, "failed to consume task");
            }
        }
    }
}

fn spawn_lane(agent_id: String, inner: Arc<SchedulerInner>) -> mpsc::UnboundedSender<LaneCmd> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneCmd>();

    tokio::spawn(async move {
        let mut heap: BinaryHeap<Reverse<ArmedTask>> = BinaryHeap::new();
        loop {
            let wait = heap.peek().map(|Reverse(next)| {
                Duration::from_millis((next.due - now_ms()).max(0) as u64)
            });

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(LaneCmd::Arm(task)) => heap.push(Reverse(task)),
                    Some(LaneCmd::Cancel(id)) => heap.retain(|Reverse(t)| t.task.id != id),
                    None => break,
                },
                _ = sleep_or_park(wait) => {
                    let now = now_ms();
                    while matches!(heap.peek(), Some(Reverse(next)) if next.due <= now) {
                        let Some(Reverse(armed)) = heap.pop() else { break };
                        inner.consume_task(&agent_id, &armed.task.id).await;
                        let Some(host) = inner.host.upgrade() else {
                            tracing::warn!(%agent_id, "host gone, dropping fired task");
                            continue;
                        };
                        tracing::debug!(%agent_id, task_id = %armed.task.id, "firing scheduled task");
                        host.receive(&agent_id, armed.task.request, None, Tag::fresh())
                            .await;
                    }
                }
            }
        }
    });

    tx
}

async fn sleep_or_park(wait: Option<Duration>) {
    match wait {
        Some(d) if d.is_zero() => {}
        Some(d) => tokio::time::sleep(d).await,
        None => futures::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use serde_json::json;

    fn scheduler() -> (TaskScheduler, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        (TaskScheduler::new(store.clone(), Weak::new()), store)
    }

    async fn persisted_ids(store: &Arc<dyn StateStore>, agent_id: &str) -> Vec<String> {
        match store.read(agent_id, TASKS_KEY).await.unwrap() {
            Some(value) => {
                let doc: TaskDoc = serde_json::from_value(value).unwrap();
                doc.tasks.into_iter().map(|t| t.id).collect()
            }
            None => Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_persists_the_task() {
        let (scheduler, store) = scheduler();
        let id = scheduler
            .create_task(
                "a",
                JsonRpcRequest::new("my_task", json!({"message": "hello"})),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(persisted_ids(&store, "a").await, vec![id]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (scheduler, store) = scheduler();
        let id = scheduler
            .create_task(
                "a",
                JsonRpcRequest::new("my_task", json!({})),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        scheduler.cancel_task("a", &id).await.unwrap();
        scheduler.cancel_task("a", &id).await.unwrap();
        scheduler.cancel_task("a", "never-existed").await.unwrap();
        assert!(persisted_ids(&store, "a").await.is_empty());
    }

    #[tokio::test]
    async fn firing_consumes_the_persisted_record() {
        let (scheduler, store) = scheduler();
        scheduler
            .create_task(
                "a",
                JsonRpcRequest::new("my_task", json!({})),
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(persisted_ids(&store, "a").await.is_empty());
    }

    #[tokio::test]
    async fn resume_is_idempotent_per_lane() {
        let (scheduler, _store) = scheduler();
        scheduler
            .create_task(
                "a",
                JsonRpcRequest::new("my_task", json!({})),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        // The lane already exists, so resume must not double-arm.
        scheduler.resume("a").await.unwrap();
        scheduler.resume("a").await.unwrap();
    }
}
