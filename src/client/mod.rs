mod config;
mod connection;
mod factory;
mod rpc_client;

pub use config::RpcClientConfig;
pub use connection::{ClientStreamCall, RpcConnection, RpcReceiver, RpcSender};
pub use factory::StreamFactory;
pub use rpc_client::RpcClient;
