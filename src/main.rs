use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use festival_sync::config::{self, BuildContext};
use festival_sync::nocodb::NocoClient;
use festival_sync::pipeline::{Pipeline, RunOptions, RunReport};

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync festival events from NocoDB and build the site data")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Fetch and snapshot the tables, then stop
    #[arg(long)]
    fetch_only: bool,

    /// Regenerate outputs even when nothing changed upstream
    #[arg(long)]
    no_reset: bool,

    /// Delete generated outputs before running
    #[arg(long, conflicts_with = "no_reset")]
    reset: bool,

    /// Re-download images that already exist on disk
    #[arg(long)]
    force_media: bool,
}

impl Args {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            fetch_only: self.fetch_only,
            no_reset: self.no_reset,
            reset: self.reset,
            force_media: self.force_media,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(report) => {
            log_report(&report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(?err, "sync failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<RunReport> {
    let cfg = config::load(Some(&args.config))?;
    let build = BuildContext::from_env();
    info!(
        production = build.production,
        branch = build.branch.as_deref().unwrap_or("-"),
        hide_unpublished = build.hide_unpublished(&cfg),
        "starting sync"
    );

    let client = NocoClient::from_config(&cfg)?;
    let pipeline = Pipeline::new(cfg, build, Arc::new(client));
    pipeline.run(args.run_options()).await
}

fn log_report(report: &RunReport) {
    for table in &report.tables {
        info!(
            table = table.kind.plural(),
            rows = table.rows.len(),
            added = table.changes.added.len(),
            changed = table.changes.changed.len(),
            removed = table.changes.removed.len(),
            degraded = table.degraded,
            "table"
        );
    }
    if report.degraded {
        warn!("some tables were served from snapshots");
    }
    if report.skipped {
        info!("nothing to regenerate");
        return;
    }
    if let Some(media) = &report.media {
        info!(
            processed = media.processed,
            reused = media.reused,
            memo_hits = media.memo_hits,
            placeholders = media.placeholders,
            rejected = media.rejected,
            "media"
        );
    }
    info!(
        events = report.events.len(),
        duplicates = report.discards.len(),
        assets = report.assets.len(),
        missing_assets = report.missing_assets,
        "sync complete"
    );
}
