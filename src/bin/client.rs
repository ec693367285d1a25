use anyhow::Result;
use duplex_rpc::{CallKind, ClientManifest, RpcClient, RpcClientConfig};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::var("RPC_ADDR").unwrap_or_else(|_| "127.0.0.1:7070".to_string());

    let manifest = ClientManifest::new()
        .with("double", CallKind::Unary)
        .with("sum", CallKind::ClientStream)
        .with("count", CallKind::ServerStream)
        .with("echo", CallKind::Duplex)
        .with("bytes", CallKind::Raw);
    let config = RpcClientConfig::builder()
        .call_timeout(Duration::from_secs(10))
        .build();

    let factory_addr = addr.clone();
    let client = RpcClient::new(
        manifest,
        move || TcpStream::connect(factory_addr.clone()),
        config,
    );
    info!(addr = %addr, "RPC client ready");

    let doubled: i64 = client.unary("double", 21).await?;
    info!(doubled, "double(21)");

    let mut call = client.client_stream::<i64, i64>("sum").await?;
    for n in 1..=10 {
        call.write(n).await?;
    }
    let total = call.result().await?;
    info!(total, "sum(1..=10)");

    let mut numbers = client.server_stream::<_, u64>("count", 5).await?;
    while let Some(n) = numbers.next().await {
        let n = n?;
        info!(n, "count");
    }

    let (mut sender, mut receiver) = client.duplex::<String, String>("echo").await?.split();
    let writer = tokio::spawn(async move {
        for line in ["alpha", "bravo", "charlie"] {
            sender.send(line.to_string()).await?;
        }
        sender.close().await
    });
    while let Some(line) = receiver.next().await {
        let line = line?;
        info!(line = %line, "echo");
    }
    writer.await??;

    let mut channel = client.raw("bytes", ()).await?;
    channel.write_all(b"raw bytes, no framing").await?;
    channel.shutdown().await?;
    let mut upper = Vec::new();
    channel.read_to_end(&mut upper).await?;
    info!(reply = %String::from_utf8_lossy(&upper), "bytes");

    client.destroy().await;
    Ok(())
}
