use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

pub(crate) fn request(id: i64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub(crate) fn notification(method: &str) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": method })
}

pub(crate) fn result(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub(crate) fn method_not_found(id: Value, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32601,
            "message": format!("Method not found: {method}"),
        }
    })
}

/// What a single line read from the server turned out to be.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response { id: i64, outcome: ResponseOutcome },
    Request { id: Value, method: String },
    Notification { method: String },
    Unrecognized,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ResponseOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

impl ResponseOutcome {
    pub(crate) fn into_result(self) -> Result<Value> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error { code, message } => Err(Error::McpRpc { code, message }),
        }
    }
}

/// Any message the server may write: a response, a request, or a notification.
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default = "default_error_code")]
    code: i64,
    #[serde(default = "default_error_message")]
    message: String,
}

fn default_error_code() -> i64 {
    -32000
}

fn default_error_message() -> String {
    "unknown error".to_string()
}

pub(crate) fn classify(message: Value) -> Incoming {
    let rpc: JsonRpcMessage = match serde_json::from_value(message) {
        Ok(rpc) => rpc,
        Err(_) => return Incoming::Unrecognized,
    };

    match (rpc.method, rpc.id) {
        (Some(method), Some(id)) => Incoming::Request { id, method },
        (Some(method), None) => Incoming::Notification { method },
        (None, Some(id)) => {
            let Some(id) = id
                .as_i64()
                .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
            else {
                return Incoming::Unrecognized;
            };
            let outcome = match rpc.error {
                Some(error) => ResponseOutcome::Error {
                    code: error.code,
                    message: error.message,
                },
                None => ResponseOutcome::Result(rpc.result.unwrap_or(Value::Null)),
            };
            Incoming::Response { id, outcome }
        }
        (None, None) => Incoming::Unrecognized,
    }
}
