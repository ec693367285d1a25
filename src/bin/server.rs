use anyhow::Result;
use async_stream::stream;
use bytes::Bytes;
use duplex_rpc::handler::ByteStream;
use duplex_rpc::message::JsonRpcRequest;
use duplex_rpc::{
    CallContext, ConnectionInfo, DecodedInbound, ErrorObject, Handler, Manifest, RpcServer,
    RpcServerConfig,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Shared by every call the demo server runs.
struct DemoState {
    served: AtomicU64,
}

impl DemoState {
    fn served(&self) -> u64 {
        self.served.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::var("RPC_ADDR").unwrap_or_else(|_| "127.0.0.1:7070".to_string());

    let state = DemoState {
        served: AtomicU64::new(0),
    };
    let config = RpcServerConfig::builder()
        .call_timeout(Duration::from_secs(60))
        .build();
    let server = Arc::new(RpcServer::new(manifest(), state, config));

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "RPC server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let info = ConnectionInfo::builder()
                    .remote_address(remote)
                    .maybe_local_address(socket.local_addr().ok())
                    .build();
                server.handle_stream(socket, info);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    server.destroy().await;
    Ok(())
}

fn manifest() -> Manifest<DemoState> {
    let mut manifest = Manifest::new();
    manifest
        .register("double", Handler::unary(double))
        .register("sum", Handler::client_stream(sum))
        .register(
            "count",
            Handler::server_stream(|n: u64, ctx: CallContext<DemoState>| {
                stream! {
                    let mut ticker = interval(Duration::from_millis(200));
                    for i in 0..n {
                        ticker.tick().await;
                        debug!(id = %ctx.id(), i, "Counting");
                        yield Ok::<_, ErrorObject>(i);
                    }
                }
            }),
        )
        .register(
            "echo",
            Handler::duplex(|inbound: DecodedInbound<String>, ctx: CallContext<DemoState>| {
                let served = ctx.container().served();
                inbound.map(move |line| line.map(|line| format!("#{served}: {line}")))
            }),
        )
        .register("bytes", Handler::raw(upper));
    manifest
}

async fn double(n: i64, ctx: CallContext<DemoState>) -> Result<i64, ErrorObject> {
    let served = ctx.container().served();
    info!(n, served, remote = ?ctx.connection().remote_address, "double");
    n.checked_mul(2)
        .ok_or_else(|| ErrorObject::invalid_params(format!("{n} doubled overflows")))
}

async fn sum(
    mut inbound: DecodedInbound<i64>,
    ctx: CallContext<DemoState>,
) -> Result<i64, ErrorObject> {
    ctx.container().served();
    let mut total = 0i64;
    while let Some(n) = inbound.next().await {
        total = total.saturating_add(n?);
    }
    Ok(total)
}

/// Echo every byte back in upper case.
async fn upper(
    request: JsonRpcRequest,
    input: ByteStream,
    ctx: CallContext<DemoState>,
) -> Result<ByteStream, ErrorObject> {
    let served = ctx.container().served();
    info!(id = %request.id, served, "Raw call started");
    Ok(input
        .map(|chunk| chunk.map(|bytes| Bytes::from(bytes.to_ascii_uppercase())))
        .boxed())
}
