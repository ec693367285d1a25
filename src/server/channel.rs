use std::collections::HashMap;
use std::future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, Stream, StreamExt, stream};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::JsonRpcCodec;
use crate::context::{CallContext, ConnectionInfo};
use crate::error::RpcError;
use crate::handler::{CallKind, Handler, RawFn};
use crate::manifest::Manifest;
use crate::message::{
    CANCEL_METHOD, CancelParams, END_METHOD, ErrorObject, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, RpcId,
};
use crate::server::call::{ActiveCall, CallKey, CallMap, ChannelId, deadline_elapsed};
use crate::server::config::RpcServerConfig;
use crate::stream::{MergeController, MergeSink, MergedStream, Remainder, extract_head, merge_channel};

type Output = MergeController<JsonRpcMessage>;

/// Where the channel reader puts the inputs of one streaming call.
enum Input {
    Open(mpsc::Sender<Value>),
    /// The call no longer takes input; later elements for it are dropped.
    Discard,
}

/// Demultiplexes one physical channel into calls.
pub(crate) struct ChannelDriver<C> {
    pub id: ChannelId,
    pub manifest: Arc<Manifest<C>>,
    pub container: Arc<C>,
    pub connection: Arc<ConnectionInfo>,
    pub config: RpcServerConfig,
    pub calls: Arc<CallMap>,
    pub tasks: TaskTracker,
    /// Cancelled when the channel must be torn down. Every call token is a child.
    pub token: CancellationToken,
}

impl<C: Send + Sync + 'static> ChannelDriver<C> {
    pub async fn run<T>(self, channel: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(channel);
        let mut codec = JsonRpcCodec::new(self.config.max_message_size);

        let head = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            head = extract_head(ReaderStream::new(reader), &mut codec) => head,
        };

        let (head, remainder) = match head {
            Ok(head) => head,
            Err(RpcError::ConnectionClosed) => {
                debug!(channel = %self.id, "Channel closed before its first message");
                return;
            }
            Err(RpcError::Io(err)) => {
                warn!(channel = %self.id, error = %err, "Channel read failed");
                return;
            }
            Err(err) => {
                warn!(channel = %self.id, error = %err, "Undecodable first message");
                let mut frames = FramedWrite::new(writer, codec);
                let reply = JsonRpcMessage::error(RpcId::Null, err.to_error_object());
                tokio::select! {
                    _ = grace_expired(&self.token, self.config.shutdown_grace) => {}
                    _ = async {
                        let _ = frames.send(reply).await;
                        let _ = frames.close().await;
                    } => {}
                }
                return;
            }
        };

        let head = match head {
            JsonRpcMessage::Request(request) => match self.manifest.get(&request.method) {
                Some(Handler::Raw(handler)) => {
                    let handler = handler.clone();
                    self.run_raw(request, handler, remainder, writer, codec).await;
                    return;
                }
                _ => JsonRpcMessage::Request(request),
            },
            other => other,
        };

        let (sink, output, merged) = merge_channel(self.config.output_buffer);
        let writer = self.tasks.spawn(write_loop(
            FramedWrite::new(writer, codec.clone()),
            merged,
            self.token.clone(),
            self.id,
            self.config.shutdown_grace,
        ));

        let messages = stream::once(future::ready(Ok(head)))
            .chain(FramedRead::new(StreamReader::new(remainder), codec));
        self.demux(messages, sink, output).await;

        // The writer ends once every call holding the output has finished.
        let _ = writer.await;
        info!(channel = %self.id, "RPC channel closed");
    }

    async fn demux<S>(&self, messages: S, sink: MergeSink<JsonRpcMessage>, output: Output)
    where
        S: Stream<Item = Result<JsonRpcMessage, RpcError>>,
    {
        let mut messages = pin!(messages);
        let mut inputs: HashMap<RpcId, Input> = HashMap::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(JsonRpcMessage::Request(request))) => {
                    self.on_request(request, &mut inputs, &sink, &output).await;
                }
                Some(Ok(JsonRpcMessage::Notification(notification))) => {
                    self.on_notification(notification, &mut inputs);
                }
                Some(Ok(response)) => {
                    warn!(channel = %self.id, id = ?response.id(), "Ignoring response sent to server");
                }
                Some(Err(RpcError::Io(err))) => {
                    warn!(channel = %self.id, error = %err, "Channel read failed");
                    self.token.cancel();
                    break;
                }
                Some(Err(err)) => {
                    warn!(channel = %self.id, error = %err, "Tearing down channel after decode error");
                    // best effort: a full output means the peer is not reading anyway
                    let _ = output.try_push(JsonRpcMessage::error(RpcId::Null, err.to_error_object()));
                    self.token.cancel();
                    break;
                }
                None => {
                    debug!(channel = %self.id, "Channel input ended");
                    break;
                }
            }
        }
        // Dropping the senders ends every streamed input on this channel.
        drop(inputs);
    }

    async fn on_request(
        &self,
        request: JsonRpcRequest,
        inputs: &mut HashMap<RpcId, Input>,
        sink: &MergeSink<JsonRpcMessage>,
        output: &Output,
    ) {
        let key = CallKey::new(self.id, request.id.clone());

        if self.calls.contains(&key) {
            self.on_input(key, request.params.unwrap_or(Value::Null), inputs);
            return;
        }
        inputs.remove(&request.id);

        let Some(handler) = self.manifest.get(&request.method) else {
            debug!(call = %key, method = %request.method, "Method not found");
            let reply = JsonRpcMessage::error(
                request.id,
                ErrorObject::method_not_found(&request.method),
            );
            let _ = output.push(reply).await;
            return;
        };

        let kind = handler.kind();
        if kind == CallKind::Raw {
            let reply = JsonRpcMessage::error(
                request.id,
                ErrorObject::invalid_request(format!(
                    "'{}' is a RAW method and must be the first message on its channel",
                    request.method
                )),
            );
            let _ = output.push(reply).await;
            return;
        }

        let method: Arc<str> = Arc::from(request.method.as_str());
        let token = self.token.child_token();
        let guard = match self
            .calls
            .try_insert(key.clone(), method.clone(), kind, token.clone())
        {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, "Refusing call");
                return;
            }
        };

        let (params, input) = match kind {
            CallKind::ClientStream | CallKind::Duplex => {
                let (tx, rx) = mpsc::channel(self.config.input_buffer.max(1));
                if let Some(first) = request.params {
                    // fresh channel with capacity >= 1
                    let _ = tx.try_send(first);
                }
                inputs.insert(request.id.clone(), Input::Open(tx));
                (Value::Null, Some(rx))
            }
            _ => (request.params.unwrap_or(Value::Null), None),
        };

        debug!(call = %key, method = %method, kind = %kind, "Starting call");
        let call = ActiveCall {
            handler: handler.clone(),
            ctx: self.context(request.id, method, token),
            params,
            input,
            sink: sink.clone(),
            output: output.clone(),
            guard,
            max_message_size: self.config.max_message_size,
        };
        self.tasks.spawn(call.run());
    }

    /// Hand one input element to its call without ever waiting on the handler.
    fn on_input(&self, key: CallKey, value: Value, inputs: &mut HashMap<RpcId, Input>) {
        let Some(Input::Open(tx)) = inputs.get(&key.id) else {
            if !inputs.contains_key(&key.id) {
                warn!(call = %key, "Dropping input for a call that is not taking any");
            }
            return;
        };
        match tx.try_send(value) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let buffered = self.config.input_buffer.max(1);
                warn!(call = %key, buffered, "Input queue full, aborting call");
                self.calls.abort(&key, ErrorObject::input_overflow(buffered));
                inputs.insert(key.id, Input::Discard);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(call = %key, "Handler dropped its input");
                inputs.insert(key.id, Input::Discard);
            }
        }
    }

    fn on_notification(&self, notification: JsonRpcNotification, inputs: &mut HashMap<RpcId, Input>) {
        let method = notification.method.as_str();
        if method == CANCEL_METHOD || method == END_METHOD {
            let target = notification
                .params
                .and_then(|params| serde_json::from_value::<CancelParams>(params).ok());
            let Some(CancelParams { id }) = target else {
                warn!(channel = %self.id, method = %notification.method, "Malformed control notification");
                return;
            };
            let key = CallKey::new(self.id, id);
            if method == CANCEL_METHOD && !self.calls.cancel(&key) {
                debug!(call = %key, "Cancel for a call that is not active");
            }
            // Dropping the sender ends the call's input.
            if inputs.remove(&key.id).is_some() {
                debug!(call = %key, method = %notification.method, "Call input closed");
            }
            return;
        }

        let Some(Handler::Unary(f)) = self.manifest.get(&notification.method) else {
            debug!(
                channel = %self.id,
                method = %notification.method,
                "Dropping notification without a unary handler"
            );
            return;
        };

        let token = self.token.child_token();
        let ctx = self.context(RpcId::Null, Arc::from(notification.method.as_str()), token.clone());
        let deadline = ctx.deadline();
        let params = notification.params.unwrap_or(Value::Null);
        let f = f.clone();
        let call = AssertUnwindSafe(async move { f(params, ctx).await }).catch_unwind();
        let method = notification.method;
        let channel = self.id;

        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = deadline_elapsed(deadline) => token.cancel(),
                outcome = call => match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => debug!(channel = %channel, method = %method, error = %err, "Notification handler failed"),
                    Err(_) => warn!(channel = %channel, method = %method, "Notification handler panicked"),
                },
            }
        });
    }

    async fn run_raw<T>(
        &self,
        request: JsonRpcRequest,
        handler: RawFn<C>,
        input: Remainder<ReaderStream<ReadHalf<T>>>,
        mut writer: WriteHalf<T>,
        codec: JsonRpcCodec,
    ) where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = CallKey::new(self.id, request.id.clone());
        let method: Arc<str> = Arc::from(request.method.as_str());
        let token = self.token.child_token();
        let Ok(_guard) = self
            .calls
            .try_insert(key.clone(), method.clone(), CallKind::Raw, token.clone())
        else {
            return;
        };
        let ctx = self.context(request.id.clone(), method, token.clone());
        let deadline = ctx.deadline();
        let id = request.id.clone();

        debug!(call = %key, "Starting raw call");
        let input = input.boxed();
        let setup = AssertUnwindSafe(async move { handler(request, input, ctx).await }).catch_unwind();
        let setup = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ErrorObject::stopping()),
            _ = deadline_elapsed(deadline) => Err(ErrorObject::timeout()),
            setup = setup => setup.unwrap_or_else(|_| Err(ErrorObject::internal("handler panicked"))),
        };

        match setup {
            Ok(output) => {
                let mut output = StreamReader::new(output);
                let copied = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(RpcError::Stopping("raw call cancelled".into())),
                    _ = deadline_elapsed(deadline) => Err(RpcError::Stopping("raw call deadline".into())),
                    copied = tokio::io::copy(&mut output, &mut writer) => copied.map_err(RpcError::from),
                };
                match copied {
                    Ok(bytes) => debug!(call = %key, bytes, "Raw call completed"),
                    Err(err) => warn!(call = %key, error = %err, "Raw call ended early"),
                }
            }
            Err(err) => {
                warn!(call = %key, code = err.code, error = %err.message, "Raw call failed during setup");
                let mut frames = FramedWrite::new(&mut writer, codec);
                tokio::select! {
                    _ = grace_expired(&token, self.config.shutdown_grace) => {}
                    _ = frames.send(JsonRpcMessage::error(id, err)) => {}
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    fn context(&self, id: RpcId, method: Arc<str>, token: CancellationToken) -> CallContext<C> {
        let deadline = self.config.call_timeout.map(|timeout| Instant::now() + timeout);
        CallContext::new(
            id,
            method,
            self.container.clone(),
            self.connection.clone(),
            token,
            deadline,
        )
    }
}

/// Serialize every call's output onto the channel's write half.
///
/// Once the channel is cancelled the remaining replies get `grace` to reach the peer.
/// After that they are dropped, which fails every call still waiting on the output.
async fn write_loop<W>(
    frames: FramedWrite<W, JsonRpcCodec>,
    output: MergedStream<JsonRpcMessage>,
    token: CancellationToken,
    channel: ChannelId,
    grace: Duration,
) where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = pump(frames, output, &token, channel) => {}
        _ = grace_expired(&token, grace) => {
            warn!(channel = %channel, ?grace, "Peer not reading, dropping unsent replies");
        }
    }
}

/// Resolves `grace` after `token` is cancelled.
async fn grace_expired(token: &CancellationToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn pump<W>(
    mut frames: FramedWrite<W, JsonRpcCodec>,
    mut output: MergedStream<JsonRpcMessage>,
    token: &CancellationToken,
    channel: ChannelId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = output.next().await {
        let id = message.id().cloned().unwrap_or(RpcId::Null);
        match frames.send(message).await {
            Ok(()) => {}
            Err(RpcError::MessageTooLarge { size, max }) => {
                warn!(channel = %channel, id = %id, size, max, "Reply over the message size limit");
                let reply = JsonRpcMessage::error(id, ErrorObject::too_large(size, max));
                if let Err(err) = frames.send(reply).await {
                    warn!(channel = %channel, error = %err, "Channel write failed");
                    token.cancel();
                    break;
                }
            }
            Err(err) => {
                warn!(channel = %channel, error = %err, "Channel write failed");
                token.cancel();
                break;
            }
        }
    }
    let _ = frames.close().await;
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use futures::stream::BoxStream;
    use serde_json::json;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::error::code;
    use crate::handler::DecodedInbound;

    fn driver(manifest: Manifest<()>) -> (ChannelDriver<()>, Arc<CallMap>) {
        let calls = Arc::new(CallMap::new());
        let driver = ChannelDriver {
            id: ChannelId::generate(),
            manifest: Arc::new(manifest),
            container: Arc::new(()),
            connection: Arc::new(ConnectionInfo::default()),
            config: RpcServerConfig::default(),
            calls: calls.clone(),
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
        };
        (driver, calls)
    }

    /// Write `messages` into a fresh channel, close the write side and collect every reply.
    async fn exchange(manifest: Manifest<()>, bytes: Vec<u8>) -> Vec<JsonRpcMessage> {
        let (driver, _calls) = driver(manifest);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(driver.run(server));

        client.write_all(&bytes).await.unwrap();
        client.shutdown().await.unwrap();

        let replies = read_all(&mut client).await;
        task.await.unwrap();
        replies
    }

    async fn read_all(client: &mut tokio::io::DuplexStream) -> Vec<JsonRpcMessage> {
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(client, &mut raw)
            .await
            .unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        let mut codec = JsonRpcCodec::default();
        let mut out = Vec::new();
        while let Some(message) = codec.decode_eof(&mut buf).unwrap() {
            out.push(message);
        }
        out
    }

    fn wire(messages: &[JsonRpcMessage]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| serde_json::to_vec(m).unwrap())
            .collect()
    }

    fn echo_manifest() -> Manifest<()> {
        let mut manifest = Manifest::new();
        manifest
            .register(
                "double",
                Handler::unary(|x: i64, _ctx: CallContext<()>| async move { Ok(x * 2) }),
            )
            .register(
                "echo",
                Handler::duplex(|input: DecodedInbound<Value>, _ctx: CallContext<()>| input),
            )
            .register(
                "sum",
                Handler::client_stream(|input: DecodedInbound<i64>, _ctx: CallContext<()>| async move {
                    Ok(input.into_ok_stream().fold(0i64, |acc, n| async move { acc + n }).await)
                }),
            )
            .register(
                "stuck",
                Handler::client_stream(|input: DecodedInbound<Value>, ctx: CallContext<()>| async move {
                    let _held = input;
                    ctx.cancelled().await;
                    Ok(Value::Null)
                }),
            )
            .register(
                "blob",
                Handler::raw(|_req, input: BoxStream<'static, _>, _ctx: CallContext<()>| async move {
                    Ok(input)
                }),
            );
        manifest
    }

    fn by_id(replies: &[JsonRpcMessage], id: u64) -> Vec<&JsonRpcMessage> {
        replies
            .iter()
            .filter(|m| m.id() == Some(&RpcId::from(id)))
            .collect()
    }

    #[tokio::test]
    async fn test_interleaved_calls_on_one_channel() {
        let bytes = wire(&[
            JsonRpcMessage::request(RpcId::from(1u64), "echo", Some(json!("a"))),
            JsonRpcMessage::request(RpcId::from(2u64), "double", Some(json!(21))),
            JsonRpcMessage::request(RpcId::from(1u64), "echo", Some(json!("b"))),
            JsonRpcMessage::request(RpcId::from(3u64), "missing", None),
        ]);

        let replies = exchange(echo_manifest(), bytes).await;

        assert_eq!(
            by_id(&replies, 1),
            vec![
                &JsonRpcMessage::result(RpcId::from(1u64), json!("a")),
                &JsonRpcMessage::result(RpcId::from(1u64), json!("b")),
            ]
        );
        assert_eq!(
            by_id(&replies, 2),
            vec![&JsonRpcMessage::result(RpcId::from(2u64), json!(42))]
        );
        let replies_3 = by_id(&replies, 3);
        let [JsonRpcMessage::ResponseError(missing)] = replies_3.as_slice() else {
            panic!("expected method not found, got {replies:?}");
        };
        assert_eq!(missing.error.code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_decode_error_replies_with_null_id() {
        let mut bytes = wire(&[JsonRpcMessage::request(RpcId::from(1u64), "double", Some(json!(1)))]);
        bytes.extend_from_slice(b"{\"jsonrpc\": 2}");

        let replies = exchange(echo_manifest(), bytes).await;

        let parse_error = replies
            .iter()
            .find_map(|m| match m {
                JsonRpcMessage::ResponseError(e) if e.id == RpcId::Null => Some(e),
                _ => None,
            })
            .expect("no channel-level error");
        assert_eq!(parse_error.error.code, code::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_raw_method_later_on_channel_is_refused() {
        let bytes = wire(&[
            JsonRpcMessage::request(RpcId::from(1u64), "double", Some(json!(1))),
            JsonRpcMessage::request(RpcId::from(2u64), "blob", None),
        ]);

        let replies = exchange(echo_manifest(), bytes).await;

        let replies_2 = by_id(&replies, 2);
        let [JsonRpcMessage::ResponseError(refused)] = replies_2.as_slice() else {
            panic!("expected invalid request, got {replies:?}");
        };
        assert_eq!(refused.error.code, code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_raw_first_message_gets_the_remainder() {
        let mut bytes = wire(&[JsonRpcMessage::request(RpcId::from(1u64), "blob", None)]);
        bytes.extend_from_slice(b"\x00\xffraw bytes");

        let (driver, _calls) = driver(echo_manifest());
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(driver.run(server));

        client.write_all(&bytes).await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut echoed)
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(echoed, b"\x00\xffraw bytes".to_vec());
    }

    #[tokio::test]
    async fn test_cancel_notification_stops_only_its_call() {
        let (driver, calls) = driver(echo_manifest());
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(driver.run(server));

        client
            .write_all(&wire(&[
                JsonRpcMessage::request(RpcId::from(1u64), "echo", None),
                JsonRpcMessage::request(RpcId::from(2u64), "echo", None),
            ]))
            .await
            .unwrap();
        while calls.len() < 2 {
            tokio::task::yield_now().await;
        }

        client
            .write_all(&wire(&[
                JsonRpcMessage::cancel(RpcId::from(1u64)),
                JsonRpcMessage::request(RpcId::from(2u64), "echo", Some(json!("still here"))),
            ]))
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let replies = read_all(&mut client).await;
        task.await.unwrap();

        let replies_1 = by_id(&replies, 1);
        let [JsonRpcMessage::ResponseError(stopped)] = replies_1.as_slice() else {
            panic!("expected stopping, got {replies:?}");
        };
        assert_eq!(stopped.error.code, code::STOPPING);
        assert_eq!(
            by_id(&replies, 2),
            vec![&JsonRpcMessage::result(RpcId::from(2u64), json!("still here"))]
        );
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_unread_input_fails_only_its_call() {
        let mut messages = vec![JsonRpcMessage::request(RpcId::from(1u64), "stuck", None)];
        for n in 0..40 {
            messages.push(JsonRpcMessage::request(RpcId::from(1u64), "stuck", Some(json!(n))));
        }
        messages.push(JsonRpcMessage::request(RpcId::from(2u64), "double", Some(json!(21))));
        messages.push(JsonRpcMessage::cancel(RpcId::from(1u64)));

        let replies = tokio::time::timeout(
            Duration::from_secs(5),
            exchange(echo_manifest(), wire(&messages)),
        )
        .await
        .expect("channel stalled behind a call that stopped reading");

        assert_eq!(
            by_id(&replies, 2),
            vec![&JsonRpcMessage::result(RpcId::from(2u64), json!(42))]
        );
        let replies_1 = by_id(&replies, 1);
        let [JsonRpcMessage::ResponseError(overflow)] = replies_1.as_slice() else {
            panic!("expected one overflow error, got {replies:?}");
        };
        assert_eq!(overflow.error.code, code::INPUT_OVERFLOW);
    }

    #[tokio::test]
    async fn test_end_closes_one_input_on_an_open_channel() {
        let (driver, calls) = driver(echo_manifest());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(driver.run(server));
        let (reader, mut writer) = tokio::io::split(client);
        let mut replies = FramedRead::new(reader, JsonRpcCodec::default());

        writer
            .write_all(&wire(&[
                JsonRpcMessage::request(RpcId::from(1u64), "sum", Some(json!(1))),
                JsonRpcMessage::request(RpcId::from(2u64), "sum", Some(json!(10))),
                JsonRpcMessage::request(RpcId::from(1u64), "sum", Some(json!(2))),
                JsonRpcMessage::request(RpcId::from(2u64), "sum", Some(json!(20))),
                JsonRpcMessage::end(RpcId::from(2u64)),
                JsonRpcMessage::request(RpcId::from(1u64), "sum", Some(json!(3))),
                JsonRpcMessage::end(RpcId::from(1u64)),
            ]))
            .await
            .unwrap();

        let mut results = Vec::new();
        for _ in 0..2 {
            let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
                .await
                .expect("sum did not finish while the channel stayed open")
                .unwrap()
                .unwrap();
            results.push(reply);
        }
        assert!(results.contains(&JsonRpcMessage::result(RpcId::from(1u64), json!(6))));
        assert!(results.contains(&JsonRpcMessage::result(RpcId::from(2u64), json!(30))));
        assert!(!task.is_finished(), "channel closed before its input ended");

        writer.shutdown().await.unwrap();
        assert!(replies.next().await.is_none());
        task.await.unwrap();
        assert!(calls.is_empty());
    }
}
