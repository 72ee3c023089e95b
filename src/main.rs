//! Gateway binary: loads configuration, wires the gateway, and serves
//! until interrupted.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tiergate::{Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::load()?;
    let listen = config.listen;
    let gateway = Gateway::new(config).await?;

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "starting gateway");

    let serving = tokio::spawn(Arc::clone(&gateway).serve(listener));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    gateway.trigger_shutdown();
    serving.await?;

    Ok(())
}
