//! Strategy worker binary entrypoint.
//! Loads configuration, starts the probe server, wires Redis, Groq and
//! Centrifugo into the supervisor, and waits for Ctrl+C / SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strategy_worker::api;
use strategy_worker::config::{LogFormat, WorkerConfig};
use strategy_worker::gateway::centrifugo::CentrifugoClient;
use strategy_worker::gateway::groq::GroqClient;
use strategy_worker::gateway::BroadcastTarget;
use strategy_worker::health::HealthTracker;
use strategy_worker::metrics::Metrics;
use strategy_worker::prompt::PromptTemplate;
use strategy_worker::stream::redis::RedisStreams;
use strategy_worker::supervisor::{Dependencies, Supervisor};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env();
    init_tracing(config.as_ref().map(|c| c.log_format).unwrap_or_default());
    let config = config.inspect_err(|e| error!(error = %e, "invalid configuration"))?;
    info!(?config, "configuration loaded");

    let template = config
        .load_prompt_template()
        .inspect_err(|e| error!(error = %e, "failed to read prompt file"))?;

    let health = Arc::new(HealthTracker::new(config.broadcast_enabled()));

    let metrics = match Metrics::install() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };
    let app = api::router(health.clone(), metrics.as_ref());
    let (_addr, server) = api::spawn_server(config.health_port, app).await?;

    let redis_info = config
        .redis_connection_info()
        .context("invalid REDIS_ADDR")?;
    let streams = RedisStreams::connect(redis_info)
        .await
        .inspect_err(|e| {
            error!(error = %e, "redis connection error");
            health.record_error(format!("Redis connection error: {e}"));
        })
        .context("connecting to redis")?;

    let inference = GroqClient::new(
        &config.inference_api_url,
        &config.inference_api_key,
        &config.model_name,
    )
    .context("building inference client")?;

    let broadcast = config.broadcast.as_ref().map(|b| {
        BroadcastTarget::new(
            Arc::new(CentrifugoClient::new(&b.api_url, &b.api_key)),
            &b.channel,
        )
    });

    let deps = Dependencies::new(Arc::new(streams), Arc::new(inference), broadcast);
    let handle = Supervisor::new(&config, PromptTemplate::new(template), deps, health)
        .start()
        .await?;

    info!("Press Ctrl+C to shut down gracefully");
    shutdown_signal().await;
    info!("shutdown signal received, stopping consumer");

    handle.shutdown().await?;
    server.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
