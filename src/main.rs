// Metered Relay - Main Entry Point
//
// Reads telemetry records from stdin (or a file), admits them against the
// metered-data budget, and writes admitted records to stdout. Records that
// cannot be sent yet stay in the durable queue and are replayed on the next
// start.

use anyhow::{Context, Result};
use clap::Parser;
use metered_relay::config::Config;
use metered_relay::limiter::{CellularConfig, DataLimiter, FileBudgetStore};
use metered_relay::logging::LogLevel;
use metered_relay::pipeline;
use metered_relay::queue::Persistor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

/// Metered Relay: telemetry admission control for metered connections
#[derive(Parser, Debug)]
#[command(name = "metered-relay")]
#[command(version)]
#[command(about = "Relay telemetry within a metered-data budget", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./metered-relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read records from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let mut config = Config::load_from_path(&config_path)?;
    if args.verbose {
        config.logging.level = LogLevel::Debug;
    }
    config.logging.init()?;

    info!("metered-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let limits = config.data_limit()?;
    let persistor = Persistor::open(&config.queue.dir).await;
    persistor
        .configure()
        .send(limits.storage.limit_bytes())
        .await
        .context("Failed to set storage limit")?;

    let (in_tx, in_rx) = mpsc::channel(16);
    let (conf_tx, conf_rx) = mpsc::channel(1);
    let (limiter, admitted) =
        DataLimiter::new(in_rx, conf_rx, Arc::new(persistor.clone()), limits.cellular);
    let limiter = match &config.state_file {
        Some(path) => limiter.with_store(Arc::new(FileBudgetStore::new(path))).await,
        None => limiter,
    };

    let limiter_task = tokio::spawn(limiter.run());
    let writer_task = tokio::spawn(pipeline::write_messages(
        admitted,
        tokio::io::stdout(),
        persistor.clone(),
    ));
    let reload_task = spawn_reload(config_path, persistor.clone(), conf_tx);

    let recovered = pipeline::feed_recovered(&persistor, &in_tx).await;
    if recovered > 0 {
        info!("Replaying {} messages from a previous run", recovered);
    }

    let read = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {:?}", path))?;
            pipeline::read_messages(BufReader::new(file), &persistor, &in_tx).await
        }
        None => pipeline::read_messages(BufReader::new(tokio::io::stdin()), &persistor, &in_tx).await,
    }
    .context("Failed to read input")?;
    drop(in_tx);

    limiter_task.await.context("Data limiter task failed")?;
    reload_task.abort();
    let delivered = writer_task
        .await
        .context("Writer task failed")?
        .context("Failed to write output")?;

    info!(
        "Relayed {} of {} messages, the rest remain queued in {:?}",
        delivered,
        read + recovered,
        persistor.dir()
    );
    Ok(())
}

/// Re-read the configuration on SIGHUP and push the data limits it names to
/// the queue and limiter
#[cfg(unix)]
fn spawn_reload(
    config_path: PathBuf,
    persistor: Persistor,
    cellular: mpsc::Sender<CellularConfig>,
) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                tracing::warn!("Live data limit reload unavailable: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match Config::reload_data_limit(&config_path) {
                Ok(limits) => {
                    info!("Reloaded data limits from {:?}", config_path);
                    limits.apply(&persistor, &cellular).await;
                }
                Err(e) => tracing::error!("Failed to reload data limits: {:#}", e),
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_reload(
    _config_path: PathBuf,
    _persistor: Persistor,
    cellular: mpsc::Sender<CellularConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { cellular.closed().await })
}
