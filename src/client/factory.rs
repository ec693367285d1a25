use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

/// Opens a fresh physical channel for each outbound call.
///
/// Any async closure returning a channel is a factory:
///
/// ```ignore
/// let client = RpcClient::new(manifest, || TcpStream::connect("127.0.0.1:7070"), config);
/// ```
pub trait StreamFactory: Send + Sync + 'static {
    type Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn open(&self) -> impl Future<Output = io::Result<Self::Channel>> + Send;
}

impl<F, Fut, T> StreamFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<T>> + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Channel = T;

    fn open(&self) -> impl Future<Output = io::Result<T>> + Send {
        self()
    }
}
