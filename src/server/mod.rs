mod call;
mod channel;
mod config;
mod rpc_server;

pub use call::{CallAlreadyActive, CallGuard, CallKey, CallMap, ChannelId};
pub use config::RpcServerConfig;
pub use rpc_server::RpcServer;
