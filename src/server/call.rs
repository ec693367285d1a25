use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use dashmap::{DashMap, Entry};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::checked;
use crate::context::CallContext;
use crate::handler::{CallKind, Handler, HandlerResult, ValueStream};
use crate::message::{ErrorObject, JsonRpcMessage, RpcId};
use crate::stream::{MergeController, MergeSink};

/// Identifies one physical channel accepted by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key of an in-flight call: ids are only unique within their channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub channel: ChannelId,
    pub id: RpcId,
}

impl CallKey {
    pub fn new(channel: ChannelId, id: RpcId) -> Self {
        Self { channel, id }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.id)
    }
}

#[derive(Debug, Error)]
#[error("call '{key}' is already active")]
pub struct CallAlreadyActive {
    pub key: CallKey,
}

#[derive(Debug)]
struct CallEntry {
    method: Arc<str>,
    kind: CallKind,
    token: CancellationToken,
    /// Sent instead of STOPPING when the call is stopped for a specific reason.
    reason: OnceLock<ErrorObject>,
}

/// Registry of every in-flight call on a server, across all of its channels.
#[derive(Debug, Default)]
pub struct CallMap {
    calls: DashMap<CallKey, CallEntry, ahash::RandomState>,
}

impl CallMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call, returning a guard that unregisters it on drop.
    pub fn try_insert(
        self: &Arc<Self>,
        key: CallKey,
        method: Arc<str>,
        kind: CallKind,
        token: CancellationToken,
    ) -> Result<CallGuard, CallAlreadyActive> {
        match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => Err(CallAlreadyActive {
                key: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                slot.insert(CallEntry {
                    method,
                    kind,
                    token,
                    reason: OnceLock::new(),
                });
                Ok(CallGuard {
                    map: Arc::clone(self),
                    key,
                })
            }
        }
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.calls.contains_key(key)
    }

    /// Cancel one call. Returns false if it is not active.
    pub fn cancel(&self, key: &CallKey) -> bool {
        self.calls
            .view(key, |_, entry| {
                debug!(call = %key, method = %entry.method, kind = %entry.kind, "Cancelling call");
                entry.token.cancel();
            })
            .is_some()
    }

    /// Stop one call and have it answer with `reason` rather than STOPPING.
    /// Returns false if it is not active.
    pub fn abort(&self, key: &CallKey, reason: ErrorObject) -> bool {
        self.calls
            .view(key, |_, entry| {
                debug!(call = %key, method = %entry.method, code = reason.code, "Aborting call");
                // the first reason wins
                let _ = entry.reason.set(reason);
                entry.token.cancel();
            })
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Keeps a call registered in its [`CallMap`] for as long as it lives.
#[derive(Debug)]
pub struct CallGuard {
    map: Arc<CallMap>,
    key: CallKey,
}

impl CallGuard {
    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Why the call was stopped, if it was aborted with a reason.
    pub fn abort_reason(&self) -> Option<ErrorObject> {
        self.map
            .calls
            .get(&self.key)
            .and_then(|entry| entry.reason.get().cloned())
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.map.calls.remove(&self.key);
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Server side plumbing of one in-flight call.
pub(crate) struct ActiveCall<C> {
    pub handler: Handler<C>,
    pub ctx: CallContext<C>,
    /// Params of a single-value input.
    pub params: Value,
    /// Input elements of a streamed input, fed by the channel reader.
    pub input: Option<mpsc::Receiver<Value>>,
    pub sink: MergeSink<JsonRpcMessage>,
    pub output: MergeController<JsonRpcMessage>,
    pub guard: CallGuard,
    /// Streamed results encoding larger than this end the call with MESSAGE_TOO_LARGE.
    pub max_message_size: usize,
}

impl<C: Send + Sync + 'static> ActiveCall<C> {
    /// Drive the handler to completion, or stop it on cancellation or deadline.
    ///
    /// Exactly one terminal error is pushed for a call that does not finish on its own.
    pub async fn run(self) {
        let ActiveCall {
            handler,
            ctx,
            params,
            input,
            sink,
            output,
            guard,
            max_message_size,
        } = self;
        let id = ctx.id().clone();
        let token = ctx.cancellation_token().clone();
        let deadline = ctx.deadline();
        let call = AssertUnwindSafe(drive(
            handler,
            ctx,
            params,
            input,
            sink,
            output.clone(),
            max_message_size,
        ))
        .catch_unwind();

        let failure = tokio::select! {
            biased;
            _ = token.cancelled() => Some(guard.abort_reason().unwrap_or_else(ErrorObject::stopping)),
            _ = deadline_elapsed(deadline) => {
                token.cancel();
                Some(ErrorObject::timeout())
            }
            finished = call => match finished {
                Ok(()) => None,
                Err(_) => Some(ErrorObject::internal("handler panicked")),
            },
        };

        if let Some(err) = failure {
            warn!(call = %guard.key(), code = err.code, error = %err.message, "Call ended early");
            if output.push(JsonRpcMessage::error(id, err)).await.is_err() {
                debug!(call = %guard.key(), "Channel gone before the call's error was written");
            }
        } else {
            debug!(call = %guard.key(), "Call completed");
        }
    }
}

async fn drive<C>(
    handler: Handler<C>,
    ctx: CallContext<C>,
    params: Value,
    input: Option<mpsc::Receiver<Value>>,
    sink: MergeSink<JsonRpcMessage>,
    output: MergeController<JsonRpcMessage>,
    max_message_size: usize,
) {
    let id = ctx.id().clone();
    let input = inbound(input, ctx.cancellation_token());

    match handler {
        Handler::Unary(f) => respond(&output, id, f(params, ctx).await).await,
        Handler::ClientStream(f) => respond(&output, id, f(input, ctx).await).await,
        Handler::ServerStream(f) => {
            pipe(id, f(params, ctx), sink, output, max_message_size).await
        }
        Handler::Duplex(f) => pipe(id, f(input, ctx), sink, output, max_message_size).await,
        Handler::Raw(_) => {
            let err = ErrorObject::invalid_request("RAW methods must open their own channel");
            respond(&output, id, Err(err)).await
        }
    }
}

/// The call's input sequence. It ends when the peer stops sending or the call is cancelled.
fn inbound(input: Option<mpsc::Receiver<Value>>, token: &CancellationToken) -> ValueStream {
    match input {
        Some(rx) => ReceiverStream::new(rx)
            .take_until(token.clone().cancelled_owned())
            .boxed(),
        None => futures::stream::empty().boxed(),
    }
}

async fn respond(
    output: &MergeController<JsonRpcMessage>,
    id: RpcId,
    result: HandlerResult<Value>,
) {
    let message = match result {
        Ok(value) => JsonRpcMessage::result(id, value),
        Err(err) => JsonRpcMessage::error(id, err),
    };
    // A closed output means the channel is gone; there is nobody left to tell.
    let _ = output.push(message).await;
}

/// Write each produced element as its own result. The first error ends the sequence,
/// and so does an element too large to send.
async fn pipe(
    id: RpcId,
    mut produced: futures::stream::BoxStream<'static, HandlerResult<Value>>,
    mut sink: MergeSink<JsonRpcMessage>,
    output: MergeController<JsonRpcMessage>,
    max_message_size: usize,
) {
    while let Some(item) = produced.next().await {
        let err = match item {
            Ok(value) => match checked(JsonRpcMessage::result(id.clone(), value), max_message_size) {
                Ok(message) => {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "Dropping oversized result and ending the call");
                    err.to_error_object()
                }
            },
            Err(err) => err,
        };
        let _ = output.push(JsonRpcMessage::error(id, err)).await;
        return;
    }
}
