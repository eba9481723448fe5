//! `VoiceChat` Media Relay - Main Entry Point

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vc_relay::config::Config;
use vc_relay::relay::{router, SfuServer};
use vc_relay::{observability, transport};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    observability::init();

    let config = Arc::new(Config::from_env()?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting VoiceChat Media Relay"
    );

    let sfu = Arc::new(SfuServer::new(Arc::clone(&config)));
    let cancel = CancellationToken::new();

    let socket = UdpSocket::bind(&config.media_bind_address)
        .await
        .with_context(|| format!("failed to bind media socket {}", config.media_bind_address))?;
    info!(address = %socket.local_addr()?, "Media socket bound");
    let media = transport::spawn(Arc::new(socket), Arc::clone(&sfu), cancel.clone());

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind control API {}", config.bind_address))?;
    info!(address = %listener.local_addr()?, "Control API listening");

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal, cleaning up...");
            cancel.cancel();
        }
    };

    axum::serve(listener, router(sfu))
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    for task in media {
        if let Err(e) = task.await {
            error!(error = %e, "Media task failed");
        }
    }

    info!("Relay shutdown complete");
    Ok(())
}
