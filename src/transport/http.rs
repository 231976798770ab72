//! HTTP carrier: outbound JSON-RPC over reqwest, inbound over axum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::Transport;
use crate::callbacks::CallbackRegistry;
use crate::config::HttpConfig;
use crate::host::AgentHost;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::types::{AgentUrl, HostError, InstantiationError, Tag, TransportError};

/// Outbound HTTP transport.
///
/// `send` fails synchronously only when the endpoint is not a URL the
/// client can dial. Everything after the handoff (connect errors, bad
/// envelopes) is reported by fulfilling the correlation tag with a
/// TRANSPORT error, never through `send`'s result.
pub struct HttpTransport {
    client: reqwest::Client,
    callbacks: Arc<CallbackRegistry>,
}

impl HttpTransport {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            callbacks,
        }
    }
}

async fn post_envelope(
    client: reqwest::Client,
    endpoint: reqwest::Url,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse, reqwest::Error> {
    client
        .post(endpoint)
        .json(request)
        .send()
        .await?
        .json::<JsonRpcResponse>()
        .await
}

#[async_trait]
impl Transport for HttpTransport {
    fn scheme(&self) -> &'static str {
        "http"
    }

    async fn send(
        &self,
        to: &AgentUrl,
        request: JsonRpcRequest,
        tag: Tag,
    ) -> Result<(), TransportError> {
        let endpoint = to.endpoint();
        let endpoint: reqwest::Url = endpoint
            .parse()
            .map_err(|_| TransportError::InvalidUrl { url: endpoint })?;
        let client = self.client.clone();
        let callbacks = self.callbacks.clone();
        let id = request.id.clone();

        tokio::spawn(async move {
            let response = match post_envelope(client, endpoint.clone(), &request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "outbound call failed");
                    JsonRpcResponse::failure(id, RpcError::transport(e.to_string()))
                }
            };
            callbacks.fulfill(&tag, response);
        });
        Ok(())
    }
}

/// Inbound HTTP surface.
///
/// `POST /agents/{id}/` carries a JSON-RPC envelope and answers with one.
/// `GET /agents/{id}/{method}?k=v` synthesizes `{method, params: {k: v}}`
/// and answers with the JSON-encoded result, or the error message.
pub struct HttpRpcServer {
    host: Arc<AgentHost>,
    config: HttpConfig,
}

impl HttpRpcServer {
    pub fn new(host: Arc<AgentHost>, config: HttpConfig) -> Self {
        Self { host, config }
    }

    pub fn router(host: Arc<AgentHost>) -> Router {
        Router::new()
            .route("/agents/:agent_id", post(post_rpc))
            .route("/agents/:agent_id/", post(post_rpc))
            .route("/agents/:agent_id/:method", get(get_rpc))
            .layer(TraceLayer::new_for_http())
            .with_state(host)
    }

    /// Bind, publish the base URL on the host, and serve in the background.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>), HostError> {
        let requested = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener =
            TcpListener::bind(&requested)
                .await
                .map_err(|e| TransportError::Unreachable {
                    url: requested.clone(),
                    message: e.to_string(),
                })?;
        let addr = listener
            .local_addr()
            .map_err(|e| HostError::Internal(e.to_string()))?;
        self.host.set_base_url(format!("http://{addr}"));

        let app = Self::router(self.host.clone());
        tracing::info!(%addr, "HTTP RPC server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "HTTP server terminated");
            }
        });
        Ok((addr, handle))
    }
}

async fn post_rpc(
    State(host): State<Arc<AgentHost>>,
    Path(agent_id): Path<String>,
    body: String,
) -> Response {
    match host.try_init_agent(&agent_id).await {
        Ok(_) => {}
        Err(InstantiationError::NotRegistered { .. }) => {
            return (
                StatusCode::NOT_FOUND,
                format!("unknown agent: {agent_id}"),
            )
                .into_response();
        }
        Err(e) => {
            return Json(JsonRpcResponse::failure(
                None,
                RpcError::internal(e.to_string()),
            ))
            .into_response();
        }
    }

    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::failure(
                None,
                RpcError::parse_error(e.to_string()),
            ))
            .into_response();
        }
    };

    let tag = Tag::fresh();
    let pending = host.callbacks().install(tag.clone());
    host.receive(&agent_id, request, None, tag).await;

    // receive always fulfills the tag before returning, so this resolves
    // immediately.
    match pending.wait(None).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => Json(JsonRpcResponse::failure(None, e)).into_response(),
    }
}

async fn get_rpc(
    State(host): State<Arc<AgentHost>>,
    Path((agent_id, method)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match host.try_init_agent(&agent_id).await {
        Ok(_) => {}
        Err(InstantiationError::NotRegistered { .. }) => {
            return (
                StatusCode::NOT_FOUND,
                format!("unknown agent: {agent_id}"),
            )
                .into_response();
        }
        Err(e) => {
            return ([(header::CONTENT_TYPE, "application/json")], e.to_string())
                .into_response();
        }
    }

    let mut params = Map::new();
    for (key, value) in query {
        params.insert(key, Value::String(value));
    }
    let request = JsonRpcRequest::new(method, Value::Object(params));

    let tag = Tag::fresh();
    let pending = host.callbacks().install(tag.clone());
    host.receive(&agent_id, request, None, tag).await;

    let response = match pending.wait(None).await {
        Ok(response) => response,
        Err(e) => JsonRpcResponse::failure(None, e),
    };

    let body = match response.into_result() {
        Ok(result) => serde_json::to_string(&result).unwrap_or_else(|_| "null".to_string()),
        Err(error) => error.message,
    };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_rejects_undialable_endpoints() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let transport = HttpTransport::new(callbacks.clone());
        let to = AgentUrl::parse("http://bad host:9/agents/x/").unwrap();

        let err = transport
            .send(&to, JsonRpcRequest::new("ping", json!({})), Tag::fresh())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
        assert_eq!(callbacks.pending_count(), 0);
    }
}
