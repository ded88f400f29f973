//! rtmpd: RTMP server daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use rtmp_core::RtmpConfig;
use rtmpd::{handlers, Dispatcher, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RtmpConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = RtmpConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RtmpConfig::default()
    });
    if let Some(listen) = std::env::args().nth(1) {
        config.server.listen = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen:?}"))?;
    }
    tracing::info!(
        listen = %config.server.listen,
        workers = config.server.workers,
        chunk_size = config.chunk.chunk_size,
        "rtmpd starting"
    );

    // Handler table: built once, shared read-only by every worker.
    let dispatcher = {
        let mut d = Dispatcher::new();
        handlers::register_defaults(&mut d);
        Arc::new(d)
    };

    let server = Server::bind(Arc::new(config), dispatcher)?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    server.run(shutdown_rx).await?;
    tracing::info!("rtmpd stopped");
    Ok(())
}
