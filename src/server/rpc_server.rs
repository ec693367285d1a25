use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::context::ConnectionInfo;
use crate::manifest::Manifest;
use crate::server::call::{CallMap, ChannelId};
use crate::server::channel::ChannelDriver;
use crate::server::config::RpcServerConfig;

/// Serves a [`Manifest`] over any number of duplex byte channels.
///
/// Each channel carries many concurrent calls, told apart by their JSON-RPC `id`.
///
/// # Example
///
/// ```ignore
/// let server = RpcServer::new(manifest, state, RpcServerConfig::default());
///
/// let listener = TcpListener::bind("127.0.0.1:7070").await?;
/// loop {
///     let (socket, remote) = listener.accept().await?;
///     let info = ConnectionInfo::builder().remote_address(remote).build();
///     server.handle_stream(socket, info);
/// }
/// ```
pub struct RpcServer<C> {
    manifest: Arc<Manifest<C>>,
    container: Arc<C>,
    config: RpcServerConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    calls: Arc<CallMap>,
}

impl<C: Send + Sync + 'static> RpcServer<C> {
    /// Create a server. `container` is handed unchanged to every call.
    pub fn new(manifest: Manifest<C>, container: C, config: RpcServerConfig) -> Self {
        info!(methods = manifest.len(), "RPC server created");
        Self {
            manifest: Arc::new(manifest),
            container: Arc::new(container),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            calls: Arc::new(CallMap::new()),
        }
    }

    /// Start serving one physical channel. Returns immediately.
    ///
    /// Must be called from within a Tokio runtime. After [`destroy`](Self::destroy) the
    /// channel is dropped straight away, which closes it.
    pub fn handle_stream<T>(&self, channel: T, connection: ConnectionInfo) -> ChannelId
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ChannelId::generate();
        if self.shutdown.is_cancelled() {
            warn!(channel = %id, "Refusing channel, server destroyed");
            return id;
        }

        info!(
            channel = %id,
            remote_address = ?connection.remote_address,
            remote_identity = ?connection.remote_identity,
            "Accepted RPC channel"
        );

        let driver = ChannelDriver {
            id,
            manifest: self.manifest.clone(),
            container: self.container.clone(),
            connection: Arc::new(connection),
            config: self.config.clone(),
            calls: self.calls.clone(),
            tasks: self.tasks.clone(),
            token: self.shutdown.child_token(),
        };
        self.tasks.spawn(driver.run(channel));
        id
    }

    /// Cancel every active call on every channel and wait for all of them to wind down.
    ///
    /// Callers see a STOPPING error for each call that was in flight.
    pub async fn destroy(&self) {
        info!(active_calls = self.calls.len(), "Destroying RPC server");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("RPC server destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of calls in flight across all channels.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn manifest(&self) -> &Manifest<C> {
        &self.manifest
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }
}
