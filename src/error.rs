use thiserror::Error;

use crate::handler::CallKind;
use crate::message::ErrorObject;

/// Error codes carried in [`ErrorObject::code`].
///
/// The negative -32xxx range follows JSON-RPC 2.0; the -3200x codes are this crate's
/// server-defined errors.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The call was cancelled: server shutdown, explicit cancel, or the peer went away.
    pub const STOPPING: i64 = -32001;
    /// The call ran past its deadline.
    pub const TIMEOUT: i64 = -32002;
    /// A message exceeded the configured size bound.
    pub const MESSAGE_TOO_LARGE: i64 = -32003;
    /// A streaming call's handler left its input unread until the queue filled.
    pub const INPUT_OVERFLOW: i64 = -32004;
}

/// Errors produced by the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Bytes on the channel are not a structurally valid JSON-RPC message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Undecoded input grew past the configured bound.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Failed to convert between a typed value and JSON.
    #[error("JSON conversion error")]
    Json(#[from] serde_json::Error),

    /// An error from the underlying byte channel.
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// The method is not in the manifest.
    #[error("no handler registered for '{0}'")]
    MethodNotFound(String),

    /// The method exists but uses a different calling convention.
    #[error("'{method}' is a {actual} method, not {expected}")]
    CallKindMismatch {
        method: String,
        expected: CallKind,
        actual: CallKind,
    },

    /// The peer answered with a ResponseError.
    #[error("remote error: {0}")]
    Remote(#[from] ErrorObject),

    /// The call was cancelled locally before it completed.
    #[error("call stopped: {0}")]
    Stopping(String),

    /// A client-side deadline expired.
    #[error("call timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// A message arrived that does not belong to this call.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The channel ended before the call produced its result.
    #[error("RPC channel closed")]
    ConnectionClosed,
}

impl RpcError {
    /// True for local cancellation and for STOPPING replies from the peer.
    pub fn is_stopping(&self) -> bool {
        match self {
            RpcError::Stopping(_) => true,
            RpcError::Remote(err) => err.is_stopping(),
            _ => false,
        }
    }

    /// The wire form used when this error has to be reported to a peer.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RpcError::MalformedMessage(msg) => ErrorObject::parse_error(msg.clone()),
            RpcError::MessageTooLarge { size, max } => ErrorObject::too_large(*size, *max),
            RpcError::Json(err) => ErrorObject::invalid_params(err.to_string()),
            RpcError::MethodNotFound(method) => ErrorObject::method_not_found(method),
            RpcError::Remote(err) => err.clone(),
            RpcError::Stopping(_) => ErrorObject::stopping(),
            RpcError::Timeout(_) => ErrorObject::timeout(),
            other => ErrorObject::internal(other.to_string()),
        }
    }
}
