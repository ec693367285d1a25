use std::fmt;

use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::code;

/// The only protocol version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved notification that stops one in-flight call on a channel.
///
/// Params are `{"id": <id of the call>}`.
pub const CANCEL_METHOD: &str = "rpc.cancel";

/// Reserved notification that ends the input of one streaming call on a channel.
///
/// Params are `{"id": <id of the call>}`. The call keeps running and answers as usual.
pub const END_METHOD: &str = "rpc.end";

/// Marker for the `"jsonrpc": "2.0"` member. Anything else fails to deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(de::Error::invalid_value(
                Unexpected::Str(&version),
                &"the literal \"2.0\"",
            ))
        }
    }
}

/// A call correlator: a string, a number, or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(Number),
    String(String),
    Null,
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => n.fmt(f),
            RpcId::String(s) => s.fmt(f),
            RpcId::Null => f.write_str("null"),
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<String> for RpcId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<RpcId> for Value {
    fn from(id: RpcId) -> Self {
        match id {
            RpcId::Number(n) => Value::Number(n),
            RpcId::String(s) => Value::String(s),
            RpcId::Null => Value::Null,
        }
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Keeps an explicit `"params": null` distinct from an absent member.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub params: Option<Value>,
    pub id: RpcId,
}

/// A fire-and-forget call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub params: Option<Value>,
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcResponseResult {
    pub jsonrpc: Version,
    pub result: Value,
    pub id: RpcId,
}

/// A failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcResponseError {
    pub jsonrpc: Version,
    pub error: ErrorObject,
    pub id: RpcId,
}

/// Params of a [`CANCEL_METHOD`] or [`END_METHOD`] notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RpcId,
}

/// The `error` member of a failed reply.
///
/// This is also the error type handlers return: whatever they fail with is sent to the
/// caller as-is, and the client surfaces it as [`RpcError::Remote`](crate::RpcError::Remote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
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
        Self::new(code::METHOD_NOT_FOUND, format!("method '{method}' not found"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_ERROR, message)
    }

    pub fn stopping() -> Self {
        Self::new(code::STOPPING, "call stopped before completion")
    }

    pub fn timeout() -> Self {
        Self::new(code::TIMEOUT, "call deadline exceeded")
    }

    pub fn too_large(size: usize, max: usize) -> Self {
        Self::new(
            code::MESSAGE_TOO_LARGE,
            format!("message of {size} bytes exceeds the {max} byte limit"),
        )
    }

    pub fn input_overflow(buffered: usize) -> Self {
        Self::new(
            code::INPUT_OVERFLOW,
            format!("more than {buffered} inputs waiting for a handler that stopped reading"),
        )
    }

    pub fn is_stopping(&self) -> bool {
        self.code == code::STOPPING
    }
}

impl From<anyhow::Error> for ErrorObject {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

/// Any JSON-RPC 2.0 message.
///
/// Variants are tried in order and every struct denies unknown members, so a value
/// carrying more than one of `method`, `result` and `error` matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    ResponseResult(JsonRpcResponseResult),
    ResponseError(JsonRpcResponseError),
}

impl JsonRpcMessage {
    pub fn request(id: RpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(JsonRpcRequest {
            jsonrpc: Version,
            method: method.into(),
            params,
            id,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(JsonRpcNotification {
            jsonrpc: Version,
            method: method.into(),
            params,
        })
    }

    pub fn result(id: RpcId, result: Value) -> Self {
        Self::ResponseResult(JsonRpcResponseResult {
            jsonrpc: Version,
            result,
            id,
        })
    }

    pub fn error(id: RpcId, error: ErrorObject) -> Self {
        Self::ResponseError(JsonRpcResponseError {
            jsonrpc: Version,
            error,
            id,
        })
    }

    /// The notification asking the peer to stop call `id`.
    pub fn cancel(id: RpcId) -> Self {
        Self::control(CANCEL_METHOD, id)
    }

    /// The notification telling the peer no more inputs follow for call `id`.
    pub fn end(id: RpcId) -> Self {
        Self::control(END_METHOD, id)
    }

    fn control(method: &str, id: RpcId) -> Self {
        let mut params = serde_json::Map::new();
        params.insert("id".to_string(), Value::from(id));
        Self::notification(method, Some(Value::Object(params)))
    }

    /// The correlator, if this message carries one.
    pub fn id(&self) -> Option<&RpcId> {
        match self {
            JsonRpcMessage::Request(m) => Some(&m.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::ResponseResult(m) => Some(&m.id),
            JsonRpcMessage::ResponseError(m) => Some(&m.id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(m) => Some(&m.method),
            JsonRpcMessage::Notification(m) => Some(&m.method),
            _ => None,
        }
    }
}
