//! Build-time run: fetch, diff, normalize, dedupe, process media, write.
use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::changes::{self, ChangeSet};
use crate::config::{BuildContext, Config};
use crate::dedupe::{Discard, DuplicateResolver};
use crate::fetcher::{fetch_all, TableSpec};
use crate::media::diagnostics::DiagnosticLog;
use crate::media::locator::FsAssetLocator;
use crate::media::rasterize::ensure_converter_available;
use crate::media::{MediaProcessor, MediaSettings, MediaStats};
use crate::model::{Event, EventKind, MediaAsset, RawRecord};
use crate::nocodb::{FetchError, TableService};
use crate::normalize::{normalize_rows, NormalizeOptions};
use crate::output::{verify_assets, OutputWriter};
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after fetching and snapshotting.
    pub fetch_only: bool,
    /// Regenerate outputs even when nothing changed upstream.
    pub no_reset: bool,
    /// Delete generated outputs before running.
    pub reset: bool,
    /// Re-process images that already exist on disk.
    pub force_media: bool,
}

/// Rows obtained for one table and how they were obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct TableFetch {
    pub kind: EventKind,
    pub rows: Vec<RawRecord>,
    pub changes: ChangeSet,
    /// Remote fetch failed; rows come from the snapshot (or are empty).
    pub degraded: bool,
    /// `rows` differ from the stored snapshot and replace it once the run
    /// has written its outputs.
    pub snapshot_stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub tables: Vec<TableFetch>,
    pub degraded: bool,
    /// Generation skipped because nothing changed.
    pub skipped: bool,
    pub events: Vec<Event>,
    pub discards: Vec<Discard>,
    pub media: Option<MediaStats>,
    /// Image references resolved to local files this run.
    pub assets: Vec<MediaAsset>,
    pub missing_assets: usize,
}

impl RunReport {
    pub fn total_changes(&self) -> usize {
        self.tables.iter().map(|t| t.changes.len()).sum()
    }
}

pub struct Pipeline {
    cfg: Config,
    build: BuildContext,
    service: Arc<dyn TableService>,
    snapshots: SnapshotStore,
    output: OutputWriter,
}

impl Pipeline {
    pub fn new(cfg: Config, build: BuildContext, service: Arc<dyn TableService>) -> Self {
        let snapshots = SnapshotStore::new(cfg.app.snapshot_dir());
        let output = OutputWriter::new(cfg.app.data_path());
        Self {
            cfg,
            build,
            service,
            snapshots,
            output,
        }
    }

    pub fn hide_unpublished(&self) -> bool {
        self.build.hide_unpublished(&self.cfg)
    }

    fn spec(&self, kind: EventKind) -> TableSpec {
        TableSpec::for_kind(kind, self.cfg.nocodb.tables.get(kind))
    }

    /// Fetch one table, falling back to its snapshot on transient failure.
    /// The snapshot itself is left alone until [`Self::commit_snapshots`].
    async fn fetch_table(&self, kind: EventKind) -> Result<TableFetch, FetchError> {
        let spec = self.spec(kind);
        match fetch_all(self.service.as_ref(), &spec).await {
            Ok(rows) => {
                let comparison = changes::compare(&self.snapshots, &spec.name, &rows).map_err(|e| {
                    FetchError::Structural {
                        table: spec.name.clone(),
                        detail: format!("snapshot I/O: {}", e),
                    }
                })?;
                Ok(TableFetch {
                    kind,
                    rows,
                    changes: comparison.changes,
                    degraded: false,
                    snapshot_stale: comparison.stale,
                })
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let fallback = match self.snapshots.load(&spec.name) {
                    Ok(Some(snapshot)) => snapshot.records,
                    Ok(None) => Vec::new(),
                    Err(io) => {
                        warn!(table = %spec.name, err = %io, "snapshot unreadable");
                        Vec::new()
                    }
                };
                warn!(
                    table = %spec.name,
                    %err,
                    fallback_rows = fallback.len(),
                    "fetch failed, using last snapshot"
                );
                Ok(TableFetch {
                    kind,
                    rows: fallback,
                    changes: ChangeSet::default(),
                    degraded: true,
                    snapshot_stale: false,
                })
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn fetch_tables(&self) -> Result<Vec<TableFetch>, FetchError> {
        let results = join_all(EventKind::ALL.iter().map(|k| self.fetch_table(*k))).await;
        results.into_iter().collect()
    }

    /// Persist the rows of every table whose snapshot is stale.
    pub fn commit_snapshots(&self, tables: &[TableFetch]) -> Result<()> {
        for table in tables.iter().filter(|t| t.snapshot_stale) {
            let name = self.spec(table.kind).name;
            self.snapshots
                .save(&name, &table.rows)
                .with_context(|| format!("failed to save snapshot for {}", name))?;
        }
        Ok(())
    }

    fn media_processor(&self, force: bool) -> Result<MediaProcessor> {
        let locator = Arc::new(FsAssetLocator::new(self.cfg.app.images_dir()));
        let mirror = if self.build.production {
            None
        } else {
            self.cfg.app.mirror_dir.as_ref().map(PathBuf::from)
        };
        let settings = MediaSettings::from_config(&self.cfg, mirror, force);
        let diagnostics = DiagnosticLog::new(
            self.cfg.app.logs_dir(),
            self.cfg.media.diagnostics.max_entries,
            self.cfg.media.diagnostics.max_age_days,
        );
        MediaProcessor::new(locator, settings, diagnostics).context("failed to build media processor")
    }

    #[instrument(skip_all, fields(fetch_only = opts.fetch_only, force_media = opts.force_media))]
    pub async fn run(&self, opts: RunOptions) -> Result<RunReport> {
        self.cfg.ensure_dirs().context("failed to create output directories")?;
        if opts.reset {
            self.output.reset().context("failed to reset outputs")?;
        }

        let tables = match self.fetch_tables().await {
            Ok(t) => t,
            Err(err) => {
                error!(%err, "fetch aborted");
                return Err(err).context("fetching source tables");
            }
        };
        let mut report = RunReport {
            degraded: tables.iter().any(|t| t.degraded),
            tables,
            ..Default::default()
        };
        info!(
            changes = report.total_changes(),
            degraded = report.degraded,
            "tables fetched"
        );

        if opts.fetch_only {
            self.commit_snapshots(&report.tables)?;
            info!("fetch-only run, skipping generation");
            return Ok(report);
        }
        if report.total_changes() == 0 && !opts.no_reset && self.output.outputs_present() {
            self.commit_snapshots(&report.tables)?;
            info!("no upstream changes, outputs kept");
            report.skipped = true;
            return Ok(report);
        }

        let normalize = NormalizeOptions {
            hide_unpublished: self.hide_unpublished(),
        };
        let events: Vec<Event> = report
            .tables
            .iter()
            .flat_map(|t| normalize_rows(t.kind, &t.rows, normalize))
            .collect();
        let resolution = DuplicateResolver::from_config(&self.cfg.dedupe).resolve(events);
        let mut events = resolution.events;
        report.discards = resolution.discards;

        let converter = &self.cfg.media.converter;
        if converter.enabled {
            if let Err(err) = ensure_converter_available(&converter.program).await {
                warn!(%err, "document converter unavailable, documents will get placeholders");
            }
        }
        let media = self.media_processor(opts.force_media)?;
        report.assets = media.process_events(&mut events).await;
        report.media = Some(media.finish());

        self.output
            .write_all(&events)
            .context("failed to write outputs")?;
        self.commit_snapshots(&report.tables)?;
        let locator = FsAssetLocator::new(self.cfg.app.images_dir());
        report.missing_assets = verify_assets(&events, &locator);
        if report.missing_assets > 0 {
            warn!(missing = report.missing_assets, "some referenced images are missing");
        }

        report.events = events;
        Ok(report)
    }
}

/// Fetch, normalize and dedupe every table without touching disk. Any
/// table failure fails the whole load.
#[instrument(skip_all)]
pub async fn load_events(service: &dyn TableService, cfg: &Config, hide_unpublished: bool) -> Result<Vec<Event>, FetchError> {
    let fetches = join_all(EventKind::ALL.iter().map(|kind| {
        let spec = TableSpec::for_kind(*kind, cfg.nocodb.tables.get(*kind));
        async move { fetch_all(service, &spec).await.map(|rows| (*kind, rows)) }
    }))
    .await;

    let opts = NormalizeOptions { hide_unpublished };
    let mut events = Vec::new();
    for fetched in fetches {
        let (kind, rows) = fetched?;
        events.extend(normalize_rows(kind, &rows, opts));
    }
    Ok(DuplicateResolver::from_config(&cfg.dedupe).resolve(events).events)
}
