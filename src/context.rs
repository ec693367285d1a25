use std::net::SocketAddr;
use std::sync::Arc;

use bon::Builder;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::message::RpcId;

/// What the transport knows about the peer on a channel.
///
/// Populated once per channel by whoever accepts it and shared by every call on it.
#[derive(Debug, Clone, Default, Builder)]
pub struct ConnectionInfo {
    pub remote_address: Option<SocketAddr>,
    pub local_address: Option<SocketAddr>,
    /// Identity the transport authenticated, if any (e.g. a node id).
    pub remote_identity: Option<String>,
    /// DER certificate chain presented by the peer.
    #[builder(default)]
    pub remote_certificates: Vec<Bytes>,
}

/// Everything a handler receives besides its input.
pub struct CallContext<C> {
    id: RpcId,
    method: Arc<str>,
    container: Arc<C>,
    connection: Arc<ConnectionInfo>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<C> Clone for CallContext<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            method: self.method.clone(),
            container: self.container.clone(),
            connection: self.connection.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }
}

impl<C> CallContext<C> {
    pub(crate) fn new(
        id: RpcId,
        method: Arc<str>,
        container: Arc<C>,
        connection: Arc<ConnectionInfo>,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            method,
            container,
            connection,
            cancel,
            deadline,
        }
    }

    /// The correlator of this call on its channel.
    pub fn id(&self) -> &RpcId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The shared dependency container the server was built with.
    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Token cancelled when the call is stopped for any reason.
    ///
    /// Child tokens can be handed to work the handler spawns.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// When the server will stop this call, if a call timeout is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_builder_defaults() {
        let info = ConnectionInfo::builder()
            .remote_identity("node-a".to_string())
            .build();
        assert_eq!(info.remote_identity.as_deref(), Some("node-a"));
        assert!(info.remote_address.is_none());
        assert!(info.remote_certificates.is_empty());
    }

    #[tokio::test]
    async fn test_context_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = CallContext::new(
            RpcId::from(1u64),
            Arc::from("m"),
            Arc::new(5u32),
            Arc::new(ConnectionInfo::default()),
            token.clone(),
            None,
        );
        let copy = ctx.clone();

        assert!(!ctx.is_cancelled());
        token.cancel();
        copy.cancelled().await;
        assert!(ctx.is_cancelled());
        assert_eq!(*ctx.container(), 5);
        assert_eq!(ctx.method(), "m");
    }
}
