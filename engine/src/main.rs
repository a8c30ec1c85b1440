//! playcast engine
//!
//! Streams local video files (one at a time, or whole playlists) to remote
//! ingest endpoints by supervising one ffmpeg process per job. Operations are
//! exposed as a small JSON API under `/api/v1`, with lifecycle and progress
//! events pushed over a WebSocket at `/api/v1/events`.
//!
//! The engine keeps no durable state: playlists and folder watches live in
//! memory and are gone after a restart.

mod api;
mod config;
mod engine;
mod error;
mod events;
mod ffmpeg;
mod folder_watch;
mod jobs;
mod options;
mod playlist;
mod shuffle;

#[cfg(all(test, unix))]
mod testutil;

use tracing::{info, warn};

use crate::{config::EngineConfig, engine::Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = EngineConfig::from_env()?;
    let addr = config.bind;
    info!(
        "ffmpeg: {}, manifests in {}, folder watch every {:?}",
        config.ffmpeg,
        config.manifest_dir.display(),
        config.watch_interval
    );

    let engine = Engine::new(config);
    let poller = folder_watch::spawn_poller(engine.clone());
    let app = api::build_router(engine.clone());

    // Bind loopback by default; put a reverse proxy in front for anything wider.
    info!("playcast engine v{} starting on http://{addr}", env!("CARGO_PKG_VERSION"));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    poller.abort();
    info!("stopping active jobs");
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
