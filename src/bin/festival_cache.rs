use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use festival_sync::cache_manager::{CacheManager, RefreshReason};
use festival_sync::config::{self, BuildContext};
use festival_sync::model::EventKind;
use festival_sync::nocodb::NocoClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Keep festival events cached in memory and log refreshes until Ctrl-C"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Skip the initial warm-up load
    #[arg(long)]
    no_warm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let hide_unpublished = BuildContext::from_env().hide_unpublished(&cfg);
    let client = NocoClient::from_config(&cfg).context("building table client")?;
    let manager = Arc::new(CacheManager::new(Arc::new(client), Arc::new(cfg), hide_unpublished));

    if !args.no_warm {
        match manager.full_refresh(RefreshReason::Manual).await {
            Ok(outcome) => info!(?outcome, "cache warmed"),
            Err(err) => warn!(%err, "warm-up failed, datasets load on first read"),
        }
        for kind in EventKind::ALL {
            match manager.get(kind).await {
                Ok(events) => info!(dataset = kind.plural(), events = events.len(), "dataset ready"),
                Err(err) => warn!(dataset = kind.plural(), %err, "dataset unavailable"),
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = manager.clone().spawn_scheduler(shutdown_rx);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    scheduler.await.context("scheduler task panicked")?;
    Ok(())
}
