//! Call/response correlation.
//!
//! Outbound sends install a pending entry keyed by a fresh tag; whichever
//! transport carries the response fulfills the tag. Entries fulfill at most
//! once, and responses for unknown tags are dropped silently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::rpc::{JsonRpcResponse, RpcError};
use crate::types::Tag;

/// Tag → pending-callback map shared between the host and its transports.
#[derive(Default)]
pub struct CallbackRegistry {
    pending: DashMap<Tag, oneshot::Sender<JsonRpcResponse>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending entry for `tag` and return the caller-side handle.
    pub fn install(self: &Arc<Self>, tag: Tag) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag.clone(), tx);
        PendingCall {
            tag,
            rx,
            registry: self.clone(),
        }
    }

    /// Fulfill `tag` with `response`. Returns false when no entry exists
    /// (late or out-of-band replies are dropped).
    pub fn fulfill(&self, tag: &Tag, response: JsonRpcResponse) -> bool {
        match self.pending.remove(tag) {
            Some((_, tx)) => {
                // A dropped receiver means the caller gave up; that is a
                // no-op fulfillment, not an error.
                let _ = tx.send(response);
                true
            }
            None => {
                tracing::debug!(%tag, "dropping response for unknown tag");
                false
            }
        }
    }

    /// Remove a pending entry without fulfilling it.
    pub fn discard(&self, tag: &Tag) {
        self.pending.remove(tag);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Caller-side handle for one outbound call.
pub struct PendingCall {
    tag: Tag,
    rx: oneshot::Receiver<JsonRpcResponse>,
    registry: Arc<CallbackRegistry>,
}

impl PendingCall {
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Block until the response arrives. With a deadline, a late response
    /// leaves a TIMEOUT error and the pending entry is removed.
    pub async fn wait(self, deadline: Option<Duration>) -> Result<JsonRpcResponse, RpcError> {
        let PendingCall { tag, rx, registry } = self;
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(RpcError::transport("pending call abandoned")),
                Err(_) => {
                    registry.discard(&tag);
                    Err(RpcError::timeout(format!(
                        "no response within {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => rx
                .await
                .map_err(|_| RpcError::transport("pending call abandoned")),
        }
    }
}
