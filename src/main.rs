#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use huddle::config::{MediaConfig, ServerConfig, TurnConfig};
use huddle::engine::MediaEngine;
use huddle::engine::stub::StubEngine;
use huddle::metrics::ServerMetrics;
use huddle::room::RoomManager;
use huddle::signaling::SignalingServer;
use huddle::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Lets in-flight responses flush before the process exits on worker death.
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - starting signaling server");

    let server_config = ServerConfig::from_env();
    let media_config = MediaConfig::from_env();

    // Load TURN config from environment (optional)
    let turn_config = TurnConfig::from_env();
    if let Some(ref tc) = turn_config {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }

    // In-process engine; a real SFU adapter implements the same traits.
    let engine: Arc<dyn MediaEngine> = Arc::new(StubEngine::new());
    let worker_pool = Arc::new(WorkerPool::new(engine, &media_config).await?);
    let mut worker_deaths = worker_pool
        .take_death_watch()
        .context("worker death watch already taken")?;
    info!(workers = worker_pool.len(), "worker pool started");

    let metrics = ServerMetrics::new();
    let manager = Arc::new(RoomManager::new(
        worker_pool,
        media_config,
        metrics.clone(),
    ));

    let signaling_server =
        SignalingServer::new(manager.clone(), &server_config, turn_config, metrics);

    // Run server until failure, shutdown signal, or worker death
    tokio::select! {
        result = signaling_server.serve(server_config.port) => {
            if let Err(e) = result {
                error!("signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl+c, shutting down");
            manager.shutdown().await;
        }
        death = worker_deaths.recv() => {
            if let Some(death) = death {
                error!(worker_id = %death.worker_id, reason = %death.reason, "media worker died");
            }
            tokio::time::sleep(WORKER_EXIT_GRACE).await;
            std::process::exit(1);
        }
    }

    info!("server shutdown complete");
    Ok(())
}
