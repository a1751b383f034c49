//! Streaming relay server binary.

use anyhow::{Context, Result};
use hydrostream::api::UpstreamClient;
use hydrostream::config::ProxyConfig;
use hydrostream::proxy::{serve, ProxyState};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting hydro-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = ProxyConfig::load()?;
    config.validate()?;

    let upstream = UpstreamClient::new(&config)?;
    info!(
        upstream = %config.upstream_url,
        model = upstream.model(),
        protocol = upstream.protocol().as_str(),
        "Loaded configuration"
    );
    if upstream.is_local_endpoint() && config.api_key.is_none() {
        warn!("no API key configured; relying on a local upstream");
    }

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let state = Arc::new(ProxyState::new(Arc::new(upstream)));
    serve(listener, state, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
    })
    .await
}
