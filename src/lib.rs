//! # duplex_rpc
//!
//! JSON-RPC 2.0 calls multiplexed over arbitrary duplex byte channels.
//!
//! Messages travel back to back on the channel with no length prefix; a message ends
//! where its JSON object ends. Beyond plain request/response the crate supports
//! streaming in either or both directions, plus RAW methods that take over the
//! channel after their opening request.
//!
//! ## Server Side
//!
//! Register handlers in a [`Manifest`], then hand every accepted channel to
//! [`RpcServer::handle_stream`]. One channel may carry any number of concurrent calls.
//!
//! ```ignore
//! use duplex_rpc::{Handler, Manifest, RpcServer, RpcServerConfig, ConnectionInfo};
//!
//! let mut manifest = Manifest::new();
//! manifest
//!     .register("double", Handler::unary(|n: i64, _ctx| async move { Ok(n * 2) }))
//!     .register("sum", Handler::client_stream(|inbound, _ctx| async move {
//!         Ok(inbound.into_ok_stream().fold(0i64, |acc, n: i64| async move { acc + n }).await)
//!     }));
//!
//! let server = RpcServer::new(manifest, state, RpcServerConfig::default());
//! let (socket, remote) = listener.accept().await?;
//! server.handle_stream(socket, ConnectionInfo::builder().remote_address(remote).build());
//! ```
//!
//! ## Client Side
//!
//! The [`RpcClient`] opens a fresh channel per call from a [`StreamFactory`] and
//! exposes one typed caller per calling convention.
//!
//! ```ignore
//! use duplex_rpc::{CallKind, ClientManifest, RpcClient, RpcClientConfig};
//! use futures::{SinkExt, StreamExt};
//!
//! let manifest = ClientManifest::new()
//!     .with("double", CallKind::Unary)
//!     .with("echo", CallKind::Duplex);
//! let client = RpcClient::new(manifest, || TcpStream::connect(addr), RpcClientConfig::default());
//!
//! let doubled: i64 = client.unary("double", 21).await?;
//!
//! let (mut sender, mut receiver) = client.duplex::<String, String>("echo").await?.split();
//! sender.send("hello".to_string()).await?;
//! sender.close().await?;
//! while let Some(reply) = receiver.next().await {
//!     println!("{}", reply?);
//! }
//! ```
//!
//! ## Cancellation
//!
//! Either side may stop a call. The client sends an `rpc.cancel` notification naming
//! the call's id; the server answers the call with a STOPPING error. Destroying the
//! server stops every call it is running the same way.
//!
//! Closing a streaming call's sender sends `rpc.end` for the call's id, which ends
//! that call's input without touching any other call sharing the channel.

pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod handler;
pub mod manifest;
pub mod message;
pub mod server;
pub mod stream;

pub use client::{
    ClientStreamCall, RpcClient, RpcClientConfig, RpcConnection, RpcReceiver, RpcSender,
    StreamFactory,
};
pub use codec::{DEFAULT_MAX_MESSAGE_SIZE, JsonRpcCodec};
pub use context::{CallContext, ConnectionInfo};
pub use error::RpcError;
pub use handler::{CallKind, DecodedInbound, Handler, HandlerResult};
pub use manifest::{ClientManifest, Manifest};
pub use message::{CANCEL_METHOD, END_METHOD, ErrorObject, JsonRpcMessage, RpcId};
pub use server::{ChannelId, RpcServer, RpcServerConfig};
