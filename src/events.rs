//! Publish/subscribe between agents.
//!
//! Subscriptions live in the publisher's persisted state; a trigger fans out
//! to every matching subscriber as an RPC to its registered callback. The
//! literal event `"*"` subscribes to everything the publisher emits.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::host::AgentHost;
use crate::state::StateStore;
use crate::types::StateError;

/// State key holding an agent's subscription table.
const SUBSCRIPTIONS_KEY: &str = "subscriptions";

/// Wildcard event name matching every trigger.
pub const WILDCARD_EVENT: &str = "*";

/// One (subscriber, event, callback) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub url: String,
    pub event: String,
    pub callback: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionDoc {
    subscriptions: Vec<Subscription>,
}

/// Stores subscription tables and fans out triggered events.
pub struct EventBus {
    store: Arc<dyn StateStore>,
    host: Weak<AgentHost>,
}

impl EventBus {
    pub fn new(store: Arc<dyn StateStore>, host: Weak<AgentHost>) -> Self {
        Self { store, host }
    }

    /// Add a subscription to `publisher_id`'s table. Duplicate triples
    /// collapse to one entry.
    ///
    /// Invoked through the `event.subscribe` builtin, so it runs under the
    /// publisher's operation lock like any other operation on it.
    pub async fn add_subscription(
        &self,
        publisher_id: &str,
        subscription: Subscription,
    ) -> Result<(), StateError> {
        let mut doc = self.read_doc(publisher_id).await?;
        if doc.subscriptions.contains(&subscription) {
            return Ok(());
        }
        tracing::debug!(
            publisher_id,
            subscriber = %subscription.url,
            event = %subscription.event,
            "adding subscription"
        );
        doc.subscriptions.push(subscription);
        self.write_doc(publisher_id, &doc).await
    }

    /// Remove a subscription. Removing an absent triple is a no-op.
    pub async fn remove_subscription(
        &self,
        publisher_id: &str,
        subscription: &Subscription,
    ) -> Result<(), StateError> {
        let mut doc = self.read_doc(publisher_id).await?;
        let before = doc.subscriptions.len();
        doc.subscriptions.retain(|s| s != subscription);
        if doc.subscriptions.len() != before {
            self.write_doc(publisher_id, &doc).await?;
        }
        Ok(())
    }

    /// The current subscription table of `publisher_id`.
    pub async fn subscriptions(&self, publisher_id: &str) -> Result<Vec<Subscription>, StateError> {
        Ok(self.read_doc(publisher_id).await?.subscriptions)
    }

    /// Fan out `event` to every matching subscriber of `publisher_id`.
    ///
    /// Deliveries are spawned concurrently: one slow or failing subscriber
    /// neither delays nor blocks the others, and a failed delivery is logged
    /// without dropping the subscription. Returns the number of deliveries
    /// initiated.
    pub async fn trigger(
        &self,
        publisher_id: &str,
        publisher_url: String,
        event: &str,
        params: Value,
    ) -> Result<usize, StateError> {
        let doc = self.read_doc(publisher_id).await?;
        let matching: Vec<Subscription> = doc
            .subscriptions
            .into_iter()
            .filter(|s| s.event == event || s.event == WILDCARD_EVENT)
            .collect();

        tracing::debug!(
            publisher_id,
            event,
            subscribers = matching.len(),
            "triggering event"
        );

        for subscription in &matching {
            let Some(host) = self.host.upgrade() else {
                tracing::warn!(publisher_id, event, "host gone, dropping event delivery");
                break;
            };
            let subscription = subscription.clone();
            let payload = json!({
                "agent": publisher_url,
                "event": event,
                "params": params,
            });
            tokio::spawn(async move {
                if let Err(e) = host
                    .send(&subscription.url, &subscription.callback, payload)
                    .await
                {
                    tracing::warn!(
                        subscriber = %subscription.url,
                        callback = %subscription.callback,
                        error = %e,
                        "event delivery failed"
                    );
                }
            });
        }

        Ok(matching.len())
    }

    async fn read_doc(&self, publisher_id: &str) -> Result<SubscriptionDoc, StateError> {
        match self.store.read(publisher_id, SUBSCRIPTIONS_KEY).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| StateError::Encoding {
                message: format!("corrupt subscription table for {publisher_id}: {e}"),
            }),
            None => Ok(SubscriptionDoc::default()),
        }
    }

    async fn write_doc(
        &self,
        publisher_id: &str,
        doc: &SubscriptionDoc,
    ) -> Result<(), StateError> {
        let value = serde_json::to_value(doc).map_err(|e| StateError::Encoding {
            message: e.to_string(),
        })?;
        self.store.write(publisher_id, SUBSCRIPTIONS_KEY, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStateStore::new()), Weak::new())
    }

    fn sub(url: &str, event: &str) -> Subscription {
        Subscription {
            url: url.to_string(),
            event: event.to_string(),
            callback: "on_event".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_subscriptions_collapse() {
        let bus = bus();
        bus.add_subscription("p", sub("local:s1", "ping")).await.unwrap();
        bus.add_subscription("p", sub("local:s1", "ping")).await.unwrap();
        assert_eq!(bus.subscriptions("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = bus();
        let s = sub("local:s1", "ping");
        bus.add_subscription("p", s.clone()).await.unwrap();
        bus.remove_subscription("p", &s).await.unwrap();
        bus.remove_subscription("p", &s).await.unwrap();
        assert!(bus.subscriptions("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trigger_matches_exact_and_wildcard() {
        let bus = bus();
        bus.add_subscription("p", sub("local:s1", "ping")).await.unwrap();
        bus.add_subscription("p", sub("local:s2", "*")).await.unwrap();
        bus.add_subscription("p", sub("local:s3", "pong")).await.unwrap();

        let delivered = bus
            .trigger("p", "local:p".to_string(), "ping", Value::Null)
            .await
            .unwrap();
        assert_eq!(delivered, 2);
    }
}
