use std::fmt;
use std::future::{self, Future};
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::CallContext;
use crate::message::{ErrorObject, JsonRpcRequest};

/// The calling convention of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Raw,
    Unary,
    ClientStream,
    ServerStream,
    Duplex,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Raw => "RAW",
            CallKind::Unary => "UNARY",
            CallKind::ClientStream => "CLIENT",
            CallKind::ServerStream => "SERVER",
            CallKind::Duplex => "DUPLEX",
        })
    }
}

/// What handlers fail with. The error object is sent to the caller unchanged.
pub type HandlerResult<T> = Result<T, ErrorObject>;

/// Untyped input sequence of a streaming call.
pub type ValueStream = BoxStream<'static, Value>;

/// Raw bytes in either direction of a RAW call.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub type UnaryFn<C> =
    Arc<dyn Fn(Value, CallContext<C>) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync>;
pub type ClientStreamFn<C> = Arc<
    dyn Fn(ValueStream, CallContext<C>) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync,
>;
pub type ServerStreamFn<C> = Arc<
    dyn Fn(Value, CallContext<C>) -> BoxStream<'static, HandlerResult<Value>> + Send + Sync,
>;
pub type DuplexFn<C> = Arc<
    dyn Fn(ValueStream, CallContext<C>) -> BoxStream<'static, HandlerResult<Value>> + Send + Sync,
>;
pub type RawFn<C> = Arc<
    dyn Fn(JsonRpcRequest, ByteStream, CallContext<C>) -> BoxFuture<'static, HandlerResult<ByteStream>>
        + Send
        + Sync,
>;

/// A registered handler, tagged with its calling convention.
///
/// Build one with the typed constructors ([`Handler::unary`] and friends); they decode
/// params into the closure's input type and encode its results back to JSON.
pub enum Handler<C> {
    Raw(RawFn<C>),
    Unary(UnaryFn<C>),
    ClientStream(ClientStreamFn<C>),
    ServerStream(ServerStreamFn<C>),
    Duplex(DuplexFn<C>),
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        match self {
            Handler::Raw(f) => Handler::Raw(f.clone()),
            Handler::Unary(f) => Handler::Unary(f.clone()),
            Handler::ClientStream(f) => Handler::ClientStream(f.clone()),
            Handler::ServerStream(f) => Handler::ServerStream(f.clone()),
            Handler::Duplex(f) => Handler::Duplex(f.clone()),
        }
    }
}

impl<C> fmt::Debug for Handler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

impl<C> Handler<C> {
    pub fn kind(&self) -> CallKind {
        match self {
            Handler::Raw(_) => CallKind::Raw,
            Handler::Unary(_) => CallKind::Unary,
            Handler::ClientStream(_) => CallKind::ClientStream,
            Handler::ServerStream(_) => CallKind::ServerStream,
            Handler::Duplex(_) => CallKind::Duplex,
        }
    }
}

impl<C: Send + Sync + 'static> Handler<C> {
    /// One value in, one value out.
    ///
    /// # Example
    /// ```ignore
    /// manifest.register(
    ///     "double",
    ///     Handler::unary(|x: i64, _ctx: CallContext<()>| async move { Ok(x * 2) }),
    /// );
    /// ```
    pub fn unary<P, R, F, Fut>(f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, CallContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        Handler::Unary(Arc::new(move |params: Value, ctx: CallContext<C>| {
            let call = decode_params::<P>(params).map(|p| f(p, ctx));
            async move { encode_result(call?.await?) }.boxed()
        }))
    }

    /// A sequence in, one value out.
    pub fn client_stream<P, R, F, Fut>(f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(DecodedInbound<P>, CallContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        Handler::ClientStream(Arc::new(move |input: ValueStream, ctx: CallContext<C>| {
            let call = f(DecodedInbound::new(input), ctx);
            async move { encode_result(call.await?) }.boxed()
        }))
    }

    /// One value in, a sequence out. An `Err` item ends the sequence.
    pub fn server_stream<P, R, F, S>(f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, CallContext<C>) -> S + Send + Sync + 'static,
        S: Stream<Item = HandlerResult<R>> + Send + 'static,
    {
        Handler::ServerStream(Arc::new(move |params: Value, ctx: CallContext<C>| {
            match decode_params::<P>(params) {
                Ok(p) => f(p, ctx)
                    .map(|item| item.and_then(encode_result))
                    .boxed(),
                Err(err) => stream::once(future::ready(Err(err))).boxed(),
            }
        }))
    }

    /// A sequence in, a sequence out. The two directions close independently.
    pub fn duplex<P, R, F, S>(f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(DecodedInbound<P>, CallContext<C>) -> S + Send + Sync + 'static,
        S: Stream<Item = HandlerResult<R>> + Send + 'static,
    {
        Handler::Duplex(Arc::new(move |input: ValueStream, ctx: CallContext<C>| {
            f(DecodedInbound::new(input), ctx)
                .map(|item| item.and_then(encode_result))
                .boxed()
        }))
    }

    /// Bytes in, bytes out.
    ///
    /// The handler receives the opening request and every byte the peer sends after it.
    /// The bytes it returns are written to the channel as-is.
    pub fn raw<F, Fut, S>(f: F) -> Self
    where
        F: Fn(JsonRpcRequest, ByteStream, CallContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<S>> + Send + 'static,
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Handler::Raw(Arc::new(
            move |header: JsonRpcRequest, input: ByteStream, ctx: CallContext<C>| {
                let call = f(header, input, ctx);
                async move { Ok::<_, ErrorObject>(call.await?.boxed()) }.boxed()
            },
        ))
    }
}

fn decode_params<P: DeserializeOwned>(params: Value) -> HandlerResult<P> {
    serde_json::from_value(params).map_err(|e| ErrorObject::invalid_params(e.to_string()))
}

fn encode_result<R: Serialize>(result: R) -> HandlerResult<Value> {
    serde_json::to_value(result)
        .map_err(|e| ErrorObject::internal(format!("failed to encode result: {e}")))
}

/// A typed view over a call's input sequence.
///
/// Each element is decoded on the way out; a value that does not fit `T` surfaces as
/// an INVALID_PARAMS error item.
pub struct DecodedInbound<T> {
    inner: ValueStream,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DecodedInbound<T> {
    pub(crate) fn new(inner: ValueStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> DecodedInbound<T> {
    /// Convert into a stream that yields decoded values and stops at the first
    /// undecodable one.
    pub fn into_ok_stream(self) -> impl Stream<Item = T> {
        self.take_while(|res| future::ready(res.is_ok()))
            .filter_map(|res| future::ready(res.ok()))
    }
}

impl<T: DeserializeOwned> Stream for DecodedInbound<T> {
    type Item = HandlerResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|value| value.map(decode_params))
    }
}
