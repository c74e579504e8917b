//! JSON-RPC 2.0 message types.

use serde::Serialize;
use serde_json::Value;

use crate::services::database::DbError;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// An incoming call. `id` is `None` for notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Validate the envelope of an already-parsed message.
    ///
    /// On failure the error comes with whatever id could be recovered, so the
    /// caller can still address its reply.
    pub fn from_value(msg: Value) -> Result<Self, (Value, RpcError)> {
        let Value::Object(mut msg) = msg else {
            return Err((
                Value::Null,
                RpcError::new(INVALID_REQUEST, "invalid request: not an object"),
            ));
        };

        let id = msg.remove("id");
        let reply_id = id.clone().unwrap_or(Value::Null);
        if let Some(version) = msg.get("jsonrpc") {
            if version.as_str() != Some("2.0") {
                return Err((
                    reply_id,
                    RpcError::new(INVALID_REQUEST, "invalid request: jsonrpc must be \"2.0\""),
                ));
            }
        }
        let method = match msg.remove("method") {
            Some(Value::String(method)) => method,
            _ => {
                return Err((
                    reply_id,
                    RpcError::new(INVALID_REQUEST, "invalid request: missing method"),
                ));
            }
        };

        Ok(Self {
            id,
            method,
            params: msg.remove("params").unwrap_or(Value::Null),
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Error object of a failed call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {message}"))
    }
}

impl From<DbError> for RpcError {
    fn from(err: DbError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Reply to a call, carrying exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}
