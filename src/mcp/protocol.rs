//! JSON-RPC 2.0 framing for the MCP session.
//!
//! The client sends requests (with an `id`, answered exactly once) and
//! notifications (no `id`, never answered). The server only ever sends
//! [`Reply`] lines: a `result` or an `error` for one request, or an error
//! with a `null` id for a line it could not read at all.

use serde::Serialize;
use serde_json::{Map, Value};

/// The MCP protocol version this implementation supports.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name for capability negotiation.
pub const SERVER_NAME: &str = "moku-mcp";

/// A JSON-RPC request ID: a string or an integer, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A request from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Identifier echoed in the reply.
    pub id: RequestId,
    /// Method name, never empty.
    pub method: String,
    /// Parameters, if the client sent any.
    pub params: Option<Value>,
}

/// A message read from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Expects exactly one reply.
    Request(Request),
    /// Never answered; only the method matters to this server.
    Notification {
        /// Notification method.
        method: String,
    },
}

/// The `error` member of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl RpcError {
    /// The line is not JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON is not a usable request, or arrived in the wrong state.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Missing or malformed params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// The server failed while building a reply.
    pub const INTERNAL_ERROR: i32 = -32603;

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The input line could not be parsed as JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error")
    }

    /// The message is not a valid request, or is not allowed right now.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    /// No handler exists for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// The params did not match what the method expects.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    /// The reply could not be produced.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

/// Outcome carried by a [`Reply`]; serialises as its `result` or `error` member.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Method succeeded.
    Result(Value),
    /// Method failed, or the message was rejected.
    Error(RpcError),
}

/// One line written back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    jsonrpc: &'static str,
    /// Request being answered; `None` (serialised as `null`) when unknown.
    pub id: Option<RequestId>,
    /// Result or error.
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Reply {
    /// Answers request `id` with the handler's outcome.
    #[must_use]
    pub fn answer(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            outcome: match outcome {
                Ok(value) => Outcome::Result(value),
                Err(error) => Outcome::Error(error),
            },
        }
    }

    /// Rejects a message whose request id is `id`, if it had a usable one.
    #[must_use]
    pub const fn rejection(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// The error code, if this reply is an error.
    #[must_use]
    pub const fn error_code(&self) -> Option<i32> {
        match &self.outcome {
            Outcome::Error(error) => Some(error.code),
            Outcome::Result(_) => None,
        }
    }
}

/// Reads one line from the client.
///
/// # Errors
///
/// Returns the reply to send back when the line is not JSON, is not a
/// JSON-RPC 2.0 object, has an unusable `id`, or names no method. The
/// rejection carries the request id whenever one could be read.
pub fn parse_message(line: &str) -> Result<Incoming, Reply> {
    let value: Value = serde_json::from_str(line)
        .map_err(|_| Reply::rejection(None, RpcError::parse_error()))?;
    let Value::Object(mut obj) = value else {
        return Err(Reply::rejection(
            None,
            RpcError::invalid_request("Message must be a JSON object"),
        ));
    };

    let id = match obj.get("id") {
        None => None,
        Some(raw) => Some(RequestId::from_value(raw).ok_or_else(|| {
            Reply::rejection(
                None,
                RpcError::invalid_request("id must be a string or an integer"),
            )
        })?),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(Reply::rejection(
            id,
            RpcError::invalid_request("jsonrpc field must be \"2.0\""),
        ));
    }

    let Some(method) = take_method(&mut obj) else {
        return Err(Reply::rejection(
            id,
            RpcError::invalid_request("method must be a non-empty string"),
        ));
    };

    Ok(match id {
        Some(id) => Incoming::Request(Request {
            id,
            method,
            params: obj.remove("params"),
        }),
        None => Incoming::Notification { method },
    })
}

fn take_method(obj: &mut Map<String, Value>) -> Option<String> {
    match obj.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => Some(method),
        _ => None,
    }
}
