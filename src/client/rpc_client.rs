use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::config::RpcClientConfig;
use crate::client::connection::{
    CallHandle, ClientStreamCall, RpcConnection, RpcReceiver, RpcSender, settle,
    write_loop,
};
use crate::client::factory::StreamFactory;
use crate::codec::{JsonRpcCodec, checked, encode_message};
use crate::error::RpcError;
use crate::handler::CallKind;
use crate::manifest::ClientManifest;
use crate::message::{JsonRpcMessage, RpcId};
use crate::stream::{MergeSink, merge_channel};

/// Calls methods on a remote [`RpcServer`](crate::RpcServer).
///
/// Every call opens its own channel from the [`StreamFactory`], writes the opening
/// request, and then drives that channel according to the method's calling convention.
///
/// # Example
///
/// ```ignore
/// let manifest = ClientManifest::new()
///     .with("double", CallKind::Unary)
///     .with("count", CallKind::ServerStream);
/// let client = RpcClient::new(manifest, || TcpStream::connect(addr), RpcClientConfig::default());
///
/// let answer: i64 = client.unary("double", 21).await?;
///
/// let mut numbers = client.server_stream::<_, u64>("count", 5).await?;
/// while let Some(n) = numbers.next().await {
///     println!("{}", n?);
/// }
/// ```
pub struct RpcClient<F> {
    manifest: ClientManifest,
    factory: F,
    config: RpcClientConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// The pieces of a freshly opened call.
struct OpenCall<T> {
    sink: MergeSink<JsonRpcMessage>,
    handle: CallHandle,
    frames: FramedRead<ReadHalf<T>, JsonRpcCodec>,
}

impl<F: StreamFactory> RpcClient<F> {
    pub fn new(manifest: ClientManifest, factory: F, config: RpcClientConfig) -> Self {
        Self {
            manifest,
            factory,
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// One value in, one value out.
    pub async fn unary<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let params = serde_json::to_value(params)?;
        let call = self.open_call(method, CallKind::Unary, Some(params)).await?;
        call.handle.end();
        settle(RpcReceiver::new(call.frames, call.handle), self.config.call_timeout).await
    }

    /// Start a call that takes a sequence of inputs and produces one result.
    pub async fn client_stream<P, R>(&self, method: &str) -> Result<ClientStreamCall<P, R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let call = self.open_call(method, CallKind::ClientStream, None).await?;
        let sender = RpcSender::new(call.sink, call.handle.clone(), self.config.max_message_size);
        let receiver = RpcReceiver::new(call.frames, call.handle);
        Ok(ClientStreamCall::new(sender, receiver, self.config.call_timeout))
    }

    /// One value in, a lazy sequence of results out.
    pub async fn server_stream<P, R>(&self, method: &str, params: P) -> Result<RpcReceiver<R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let params = serde_json::to_value(params)?;
        let call = self.open_call(method, CallKind::ServerStream, Some(params)).await?;
        call.handle.end();
        Ok(RpcReceiver::new(call.frames, call.handle))
    }

    /// Start a call where inputs and outputs flow independently.
    pub async fn duplex<P, R>(&self, method: &str) -> Result<RpcConnection<P, R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let call = self.open_call(method, CallKind::Duplex, None).await?;
        let sender = RpcSender::new(call.sink, call.handle.clone(), self.config.max_message_size);
        let receiver = RpcReceiver::new(call.frames, call.handle);
        Ok(RpcConnection::new(sender, receiver))
    }

    /// Open a channel for a RAW method and write its opening request.
    ///
    /// Everything after that is plain bytes in both directions, so the channel is
    /// handed back as-is.
    pub async fn raw<P: Serialize>(&self, method: &str, params: P) -> Result<F::Channel, RpcError> {
        self.check_kind(method, CallKind::Raw)?;
        let params = serde_json::to_value(params)?;
        let request = JsonRpcMessage::request(self.new_id(), method, Some(params));
        let header = encode_message(&checked(request, self.config.max_message_size)?)?;

        let mut channel = self.factory.open().await?;
        channel.write_all(&header).await?;
        debug!(method = %method, "Opened raw call");
        Ok(channel)
    }

    /// Stop every call in flight and wait for their channels to close.
    ///
    /// Calls that were waiting for results fail with a stopping error.
    pub async fn destroy(&self) {
        info!("Destroying RPC client");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn manifest(&self) -> &ClientManifest {
        &self.manifest
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    fn check_kind(&self, method: &str, expected: CallKind) -> Result<(), RpcError> {
        match self.manifest.kind_of(method) {
            None => Err(RpcError::MethodNotFound(method.to_string())),
            Some(actual) if actual != expected => Err(RpcError::CallKindMismatch {
                method: method.to_string(),
                expected,
                actual,
            }),
            Some(_) => Ok(()),
        }
    }

    fn new_id(&self) -> RpcId {
        RpcId::String(Uuid::new_v4().to_string())
    }

    async fn open_call(
        &self,
        method: &str,
        kind: CallKind,
        params: Option<Value>,
    ) -> Result<OpenCall<F::Channel>, RpcError> {
        self.check_kind(method, kind)?;
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Stopping("client destroyed".to_string()));
        }

        let id = self.new_id();
        let request = checked(
            JsonRpcMessage::request(id.clone(), method, params),
            self.config.max_message_size,
        )?;

        let channel = self.factory.open().await?;
        let (reader, writer) = tokio::io::split(channel);
        let codec = JsonRpcCodec::new(self.config.max_message_size);
        let (sink, output, merged) = merge_channel(self.config.write_buffer);
        let token = self.shutdown.child_token();

        // capacity is at least one, so the opening request never waits
        output
            .try_push(request)
            .map_err(|_| RpcError::ConnectionClosed)?;
        self.tasks.spawn(write_loop(
            FramedWrite::new(writer, codec.clone()),
            merged,
            token.clone(),
        ));

        debug!(id = %id, method = %method, kind = %kind, "Opened call");
        Ok(OpenCall {
            sink,
            handle: CallHandle {
                id,
                method: Arc::from(method),
                output,
                token,
            },
            frames: FramedRead::new(reader, codec),
        })
    }
}
