//! Node entrypoint: configuration, logging, boot, graceful shutdown.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxy_runtime::{Runtime, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(name = "proxy-node", version, about = "Multi-tenant event-sourced settlement core")]
struct Cli {
    /// Directory for the transaction log and local state.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// SQLite database path; omit to run memory-only with the journal.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the tick interval in milliseconds.
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    let mut config = RuntimeConfig::from_env()?;
    config.data_dir = cli.data_dir;
    if cli.db.is_some() {
        config.db_path = cli.db;
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.autotick_interval_ms = tick_ms.max(1);
    }

    let runtime = Runtime::start(config).await?;
    info!(
        data_dir = %runtime.config().data_dir.display(),
        mirrored = runtime.config().db_path.is_some(),
        tick_ms = runtime.config().autotick_interval_ms,
        "node started"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    runtime.shutdown().await;

    let stats = runtime.kernel().stats().await;
    info!(
        records = stats.records,
        events = stats.events,
        outbox = stats.outbox_depth,
        "final store stats"
    );
    Ok(())
}
