//! Transports carry JSON-RPC envelopes between hosts.
//!
//! A transport only moves bytes: outbound requests leave through `send`
//! with a correlation tag, and whatever comes back is reported by
//! fulfilling that tag in the callback registry the transport was built
//! with. `local:` addressing never reaches a transport; the host
//! short-circuits it.

use async_trait::async_trait;

use crate::rpc::JsonRpcRequest;
use crate::types::{AgentUrl, Tag, TransportError};

mod http;

pub use http::{HttpRpcServer, HttpTransport};

/// An outbound message carrier, selected by URL scheme.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The URL scheme this transport serves.
    fn scheme(&self) -> &'static str;

    /// Hand off `request` for delivery to `to`. The eventual response (or a
    /// transport failure) is reported by fulfilling `tag`; `send` itself
    /// only fails when the handoff is impossible.
    async fn send(
        &self,
        to: &AgentUrl,
        request: JsonRpcRequest,
        tag: Tag,
    ) -> Result<(), TransportError>;
}
