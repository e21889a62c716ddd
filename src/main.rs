use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sluice::config::{LogFormat, SluiceConfig};
use sluice::pipeline::{DrainLoop, ProducerLoop};
use sluice::ratelimit::{LimiterSettings, SlidingWindowLimiter};
use sluice::sink;
use sluice::store::RedisStore;

#[derive(Debug, Parser)]
#[command(version, about = "Rate-limited queue drainer")]
struct Cli {
    /// Optional YAML configuration file; environment variables override it
    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drain the queue into the publish sink under the rate limit
    Drain,
    /// Push synthetic bursts onto the queue
    Produce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SluiceConfig::load(cli.config.as_deref()).context("invalid configuration")?;

    init_tracing(config.logging.format);

    info!("Starting Sluice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        store = %format!("{}:{}", config.store.host, config.store.port),
        queue_key = %config.store.queue_key,
        rate_limit = config.limiter.rate_limit,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = match cli.command {
        Command::Drain => drain(config, cancel).await,
        Command::Produce => produce(config, cancel).await,
    };
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Sluice failed");
    }
    result?;

    info!("Sluice stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn drain(config: SluiceConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let sink = sink::connect(&config.sink, &config.store)
        .await
        .context("failed to set up publish sink")?;

    let mut workers = Vec::with_capacity(config.drain.workers);
    for worker in 0..config.drain.workers {
        // One store per worker: each competes with its own connections.
        let store = RedisStore::connect(&config.store)
            .await
            .with_context(|| format!("failed to connect to Redis for worker {}", worker))?;
        let settings = LimiterSettings::from_config(&config.store, &config.limiter, &config.drain);
        let limiter = SlidingWindowLimiter::new(Arc::new(store), settings);
        let drain_loop =
            DrainLoop::from_config(limiter, sink.clone(), &config.drain).with_worker(worker);

        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move { drain_loop.run(cancel).await }));
    }
    info!(workers = workers.len(), "Drain workers running");

    let mut forwarded = 0;
    for outcome in futures::future::join_all(workers).await {
        forwarded += outcome.context("drain worker panicked")?.forwarded;
    }
    info!(forwarded, "All drain workers stopped");
    Ok(())
}

async fn produce(config: SluiceConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let store = RedisStore::connect(&config.store)
        .await
        .context("failed to connect to Redis")?;
    let producer = ProducerLoop::new(Arc::new(store), config.store.queue_key.clone(), &config.producer);
    producer.run(cancel).await;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
