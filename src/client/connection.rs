use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{JsonRpcCodec, checked};
use crate::error::RpcError;
use crate::message::{JsonRpcMessage, RpcId};
use crate::stream::{MergeController, MergeSink, MergedStream};

/// Control handle shared by both halves of one outbound call.
#[derive(Clone)]
pub(crate) struct CallHandle {
    pub id: RpcId,
    pub method: Arc<str>,
    pub output: MergeController<JsonRpcMessage>,
    pub token: CancellationToken,
}

impl CallHandle {
    /// Close the write side once everything already written has been sent.
    pub fn end(&self) {
        self.output.close();
    }

    /// Ask the server to stop the call, then stop it locally.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(id = %self.id, method = %self.method, "Cancelling call");
            // best effort: the channel may already be closed or full
            let _ = self.output.try_push(JsonRpcMessage::cancel(self.id.clone()));
        }
        self.token.cancel();
    }
}

/// Write a call's outbound messages to its channel until the write side ends.
pub(crate) async fn write_loop<W>(
    mut frames: FramedWrite<W, JsonRpcCodec>,
    mut output: MergedStream<JsonRpcMessage>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            message = output.next() => message,
            _ = token.cancelled() => None,
        };
        let Some(message) = next else {
            break;
        };
        if let Err(err) = frames.send(message).await {
            warn!(error = %err, "Call write failed");
            token.cancel();
            break;
        }
    }
    // shuts down the write half, which the server reads as end of input
    let _ = frames.close().await;
}

/// The read side of a call: decoded results in arrival order.
///
/// A ResponseError ends the stream after being yielded as [`RpcError::Remote`]. The
/// stream also ends when the server closes the channel.
pub struct RpcReceiver<R> {
    inner: BoxStream<'static, Result<R, RpcError>>,
    handle: CallHandle,
}

impl<R: DeserializeOwned + Send + 'static> RpcReceiver<R> {
    pub(crate) fn new<T>(mut frames: FramedRead<ReadHalf<T>, JsonRpcCodec>, handle: CallHandle) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = handle.id.clone();
        let token = handle.token.clone();

        let inner = stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(RpcError::Stopping("call cancelled".to_string())),
                    frame = frames.next() => match frame {
                        Some(frame) => frame.and_then(|message| classify::<R>(message, &id)),
                        None => break,
                    },
                };
                match next {
                    Ok(Some(value)) => yield Ok(value),
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
            handle,
        }
    }
}

impl<R> RpcReceiver<R> {
    /// Stop the call. The stream then yields a stopping error and ends.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn id(&self) -> &RpcId {
        &self.handle.id
    }
}

/// Match one inbound message against the call it arrived on.
fn classify<R: DeserializeOwned>(message: JsonRpcMessage, id: &RpcId) -> Result<Option<R>, RpcError> {
    match message {
        JsonRpcMessage::ResponseResult(response) if response.id == *id => {
            Ok(Some(serde_json::from_value(response.result)?))
        }
        // a null id is the server rejecting the whole channel
        JsonRpcMessage::ResponseError(response)
            if response.id == *id || response.id == RpcId::Null =>
        {
            Err(RpcError::Remote(response.error))
        }
        JsonRpcMessage::Notification(notification) => {
            debug!(method = %notification.method, "Ignoring notification on call channel");
            Ok(None)
        }
        other => Err(RpcError::UnexpectedMessage(format!(
            "expected a response to '{id}', got id {:?}",
            other.id()
        ))),
    }
}

impl<R> Stream for RpcReceiver<R> {
    type Item = Result<R, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// The write side of a streaming call.
///
/// Each item is sent as one input element. Closing the sink sends `rpc.end` for the
/// call and then ends the call's input.
pub struct RpcSender<P> {
    sink: MergeSink<JsonRpcMessage>,
    handle: CallHandle,
    max_message_size: usize,
    ended: bool,
    _marker: PhantomData<fn(P)>,
}

impl<P> RpcSender<P> {
    pub(crate) fn new(
        sink: MergeSink<JsonRpcMessage>,
        handle: CallHandle,
        max_message_size: usize,
    ) -> Self {
        Self {
            sink,
            handle,
            max_message_size,
            ended: false,
            _marker: PhantomData,
        }
    }

    /// Stop the call. The paired receiver yields a stopping error.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<P: Serialize> Sink<P> for RpcSender<P> {
    type Error = RpcError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        if self.handle.token.is_cancelled() {
            return Poll::Ready(Err(RpcError::Stopping("call cancelled".to_string())));
        }
        Pin::new(&mut self.sink)
            .poll_ready(cx)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn start_send(mut self: Pin<&mut Self>, item: P) -> Result<(), RpcError> {
        let params = serde_json::to_value(&item)?;
        let message = JsonRpcMessage::request(
            self.handle.id.clone(),
            &*self.handle.method,
            Some(params),
        );
        let message = checked(message, self.max_message_size)?;
        Pin::new(&mut self.sink)
            .start_send(message)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        if !self.ended {
            let this = &mut *self;
            // a closed or cancelled channel has nothing left to end
            if let Ok(()) = ready!(Pin::new(&mut this.sink).poll_ready(cx)) {
                let end = JsonRpcMessage::end(this.handle.id.clone());
                let _ = Pin::new(&mut this.sink).start_send(end);
            }
            this.ended = true;
            this.handle.end();
        }
        Pin::new(&mut self.sink)
            .poll_close(cx)
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// A duplex call: a [`Sink`] of inputs and a [`Stream`] of outputs.
///
/// Split it to drive both directions from separate tasks.
pub struct RpcConnection<P, R> {
    sender: RpcSender<P>,
    receiver: RpcReceiver<R>,
}

impl<P, R> RpcConnection<P, R> {
    pub(crate) fn new(sender: RpcSender<P>, receiver: RpcReceiver<R>) -> Self {
        Self { sender, receiver }
    }

    pub fn split(self) -> (RpcSender<P>, RpcReceiver<R>) {
        (self.sender, self.receiver)
    }

    pub fn cancel(&self) {
        self.sender.cancel();
    }
}

impl<P: Serialize, R> RpcConnection<P, R> {
    pub async fn write(&mut self, value: P) -> Result<(), RpcError> {
        self.sender.send(value).await
    }

    /// Close the input side. Outputs keep arriving until the server finishes.
    pub async fn end(&mut self) -> Result<(), RpcError> {
        self.sender.close().await
    }
}

impl<P: Serialize, R> Sink<P> for RpcConnection<P, R> {
    type Error = RpcError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        Pin::new(&mut self.sender).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: P) -> Result<(), RpcError> {
        Pin::new(&mut self.sender).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        Pin::new(&mut self.sender).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        Pin::new(&mut self.sender).poll_close(cx)
    }
}

impl<P, R> Stream for RpcConnection<P, R> {
    type Item = Result<R, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// A client-stream call: write any number of inputs, then read the single result.
pub struct ClientStreamCall<P, R> {
    sender: RpcSender<P>,
    receiver: RpcReceiver<R>,
    timeout: Option<Duration>,
}

impl<P: Serialize, R> ClientStreamCall<P, R> {
    pub(crate) fn new(sender: RpcSender<P>, receiver: RpcReceiver<R>, timeout: Option<Duration>) -> Self {
        Self {
            sender,
            receiver,
            timeout,
        }
    }

    pub async fn write(&mut self, value: P) -> Result<(), RpcError> {
        self.sender.send(value).await
    }

    /// Close the input side without waiting for the result.
    pub async fn end(&mut self) -> Result<(), RpcError> {
        self.sender.close().await
    }

    /// End the input if still open and wait for the handler's result.
    pub async fn result(mut self) -> Result<R, RpcError> {
        self.sender.close().await?;
        settle(self.receiver, self.timeout).await
    }

    pub fn cancel(&self) {
        self.sender.cancel();
    }
}

/// Wait for the first result of a call, cancelling it if `timeout` expires first.
pub(crate) async fn settle<R>(mut receiver: RpcReceiver<R>, timeout: Option<Duration>) -> Result<R, RpcError> {
    let handle = receiver.handle.clone();
    let first = async move {
        receiver
            .next()
            .await
            .unwrap_or(Err(RpcError::ConnectionClosed))
    };
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, first).await {
            Ok(result) => result,
            Err(elapsed) => {
                handle.cancel();
                Err(elapsed.into())
            }
        },
        None => first.await,
    }
}
