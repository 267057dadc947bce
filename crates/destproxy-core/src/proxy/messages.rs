//! JSON-RPC 2.0 envelopes exchanged with clients and upstreams.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Generic proxy failure.
pub const GENERIC_ERROR_CODE: i32 = -32000;
/// The circuit breaker rejected the request.
pub const CIRCUIT_OPEN_CODE: i32 = -32001;
/// The inbound body was not valid JSON-RPC.
pub const PARSE_ERROR_CODE: i32 = -32700;

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (should be "2.0").
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl JsonRpcRequest {
    /// Build a request with the current protocol version.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response message. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (should be "2.0").
    pub jsonrpc: String,
    /// Result (on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request ID (matches the request); serialized as `null` when unknown.
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Optional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object.
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Error response.
    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Whether this response carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Interpret an upstream JSON body as a response.
    ///
    /// Objects shaped like a JSON-RPC response keep their result or error; any
    /// other value becomes the `result`. The upstream `id` wins over
    /// `fallback_id` when present and non-null.
    pub fn from_upstream(body: Value, fallback_id: Option<Value>) -> Self {
        let Value::Object(mut map) = body else {
            return Self::success(fallback_id, body);
        };
        if !is_response_envelope(&map) {
            return Self::success(fallback_id, Value::Object(map));
        }

        let id = match map.remove("id") {
            Some(Value::Null) | None => fallback_id,
            Some(id) => Some(id),
        };

        if let Some(error) = map.remove("error").filter(|e| !e.is_null()) {
            match serde_json::from_value::<JsonRpcError>(error.clone()) {
                Ok(error) => return Self::failure(id, error),
                Err(_) => {
                    return Self::failure(
                        id,
                        JsonRpcError::new(GENERIC_ERROR_CODE, "Upstream returned a malformed error", Some(error)),
                    );
                }
            }
        }

        // An explicit `"result": null` is a valid success.
        Self::success(id, map.remove("result").unwrap_or(Value::Null))
    }
}

fn is_response_envelope(map: &Map<String, Value>) -> bool {
    map.contains_key("jsonrpc") && (map.contains_key("result") || map.contains_key("error"))
}
