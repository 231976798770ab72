//! JSON-RPC envelope types.
//!
//! Requests and responses cross every transport in this shape, so the types
//! here are plain serde structs with no behavior beyond construction and
//! result extraction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod dispatch;
pub mod registry;

/// JSON-RPC error codes used by the runtime.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Implementation-defined server range.
    pub const NOT_FOUND: i64 = -32000;
    pub const NOT_AUTHORIZED: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
    pub const TRANSPORT: i64 = -32003;
}

/// A JSON-RPC error object, carried inside the response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(code::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(code::METHOD_NOT_FOUND, format!("unknown method: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(code::NOT_FOUND, message)
    }

    pub fn not_authorized(method: &str) -> Self {
        Self::new(code::NOT_AUTHORIZED, format!("not authorized: {method}"))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(code::TIMEOUT, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(code::TRANSPORT, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// A JSON-RPC request.
///
/// `params` is an object keyed by parameter name; a missing or `null` params
/// field is treated as the empty object by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }
}

/// A JSON-RPC response. Exactly one of `result` / `error` is present; a
/// successful void invocation carries `"result": null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, error: RpcError) -> Self {
        Self {
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let request =
            JsonRpcRequest::new("ping", json!({"message": "hi"})).with_id(json!(1));
        let text = serde_json::to_string(&request).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, "ping");
        assert_eq!(back.params, json!({"message": "hi"}));
        assert_eq!(back.id, Some(json!(1)));
    }

    #[test]
    fn missing_params_defaults_to_null() {
        let back: JsonRpcRequest =
            serde_json::from_str(r#"{"method":"ping","id":2}"#).unwrap();
        assert_eq!(back.params, Value::Null);
    }

    #[test]
    fn void_success_serializes_null_result() {
        let response = JsonRpcResponse::success(Some(json!(1)), Value::Null);
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains(r#""result":null"#));
        assert!(!text.contains("error"));
    }

    #[test]
    fn into_result_surfaces_errors() {
        let response =
            JsonRpcResponse::failure(None, RpcError::method_not_found("nope"));
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, code::METHOD_NOT_FOUND);
    }
}
