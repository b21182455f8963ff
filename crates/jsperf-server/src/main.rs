use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use jsperf_core::{TracingLogger, TransferLogger};
use jsperf_server::{Cli, Server, app, conn_options, tls};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jsperf_server=info,jsperf_core=info,tower_http=info".into()),
        )
        .init();

    let config = Cli::parse().into_config()?;

    let tls = tls::load_server_config(&config.cert, &config.key, config.mode.alpn())
        .with_context(|| format!("loading TLS material from {}", config.cert.display()))?;

    let logger: Arc<dyn TransferLogger> = Arc::new(TracingLogger);
    let router = app(&config, logger.clone());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    let server = Server::new(listener, tls, router, logger, conn_options(&config));

    info!("jsperf {} server listening on {}", config.mode, server.local_addr()?);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
