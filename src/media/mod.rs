//! Resolve event image URLs to local WebP files.
use futures::stream::{self, StreamExt};
use once_cell::sync::{Lazy, OnceCell as SyncOnceCell};
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Canvas, Config, Converter};
use crate::fsutil::write_atomic;
use crate::model::{numeric_suffix, AssetKind, Event, EventKind, MediaAsset};

pub mod diagnostics;
pub mod locator;
pub mod rasterize;
pub mod transcode;

use diagnostics::{DiagnosticEntry, DiagnosticLog, Severity};
use locator::{AssetLocator, AssetPath};
use transcode::{Fit, SourceKind};

/// `logo.png(https://...)` cells from CSV exports.
static CSV_ARTIFACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(jpg|jpeg|png|webp|gif|svg)\(").expect("valid artifact regex")
});

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source returned {0}")]
    Status(StatusCode),
    #[error("unsupported content type {0}")]
    ContentType(String),
    #[error("empty response body")]
    EmptyBody,
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image dimensions {width}x{height} out of range")]
    Dimensions { width: u32, height: u32 },
    #[error("document conversion failed: {0}")]
    Conversion(String),
    #[error("SVG rendering failed: {0}")]
    Vector(String),
    #[error("document conversion disabled")]
    ConversionDisabled,
    #[error("timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker failed: {0}")]
    Worker(String),
}

impl MediaError {
    /// Short, stable label used to group diagnostics.
    pub fn reason(&self) -> &'static str {
        match self {
            MediaError::InvalidUrl(_) => "invalid-url",
            MediaError::Request(e) if e.is_timeout() => "timeout",
            MediaError::Request(_) => "request",
            MediaError::Status(_) => "http-status",
            MediaError::ContentType(_) => "content-type",
            MediaError::EmptyBody => "empty-body",
            MediaError::Decode(_) => "decode",
            MediaError::Dimensions { .. } => "dimensions",
            MediaError::Conversion(_) => "conversion",
            MediaError::Vector(_) => "vector",
            MediaError::ConversionDisabled => "conversion-disabled",
            MediaError::Timeout => "timeout",
            MediaError::Io(_) => "io",
            MediaError::Worker(_) => "worker",
        }
    }
}

/// Counters for one processing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaStats {
    pub processed: usize,
    pub reused: usize,
    pub memo_hits: usize,
    pub placeholders: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicUsize,
    reused: AtomicUsize,
    memo_hits: AtomicUsize,
    placeholders: AtomicUsize,
    rejected: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MediaStats {
        MediaStats {
            processed: self.processed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            memo_hits: self.memo_hits.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// One image to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub source_url: String,
    pub kind: EventKind,
    pub event_id: String,
    pub asset: AssetKind,
}

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub workers: usize,
    pub timeout: Duration,
    pub canvas: Canvas,
    pub speaker_canvas: Canvas,
    pub placeholder: Canvas,
    pub converter: Converter,
    /// Second copy of every written file, relative paths preserved.
    pub mirror_root: Option<PathBuf>,
    /// Skip the on-disk probe and re-process every source.
    pub force: bool,
}

impl MediaSettings {
    pub fn from_config(cfg: &Config, mirror_root: Option<PathBuf>, force: bool) -> Self {
        let m = &cfg.media;
        Self {
            workers: m.workers,
            timeout: Duration::from_secs(m.timeout_secs),
            canvas: m.canvas,
            speaker_canvas: m.speaker_canvas,
            placeholder: m.placeholder,
            converter: m.converter.clone(),
            mirror_root,
            force,
        }
    }
}

pub struct MediaProcessor {
    http: Client,
    locator: Arc<dyn AssetLocator>,
    settings: MediaSettings,
    diagnostics: DiagnosticLog,
    memo: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
    placeholder_bytes: SyncOnceCell<Vec<u8>>,
    counters: Counters,
}

impl std::fmt::Debug for MediaProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaProcessor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Reject URLs that cannot be fetched, without touching the network.
pub fn check_source_url(raw: &str) -> Result<Url, MediaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MediaError::InvalidUrl("empty".into()));
    }
    if CSV_ARTIFACT_RE.is_match(trimmed) {
        return Err(MediaError::InvalidUrl(format!("export artifact: {}", trimmed)));
    }
    let url = Url::parse(trimmed).map_err(|e| MediaError::InvalidUrl(format!("{}: {}", trimmed, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(MediaError::InvalidUrl(format!("unsupported scheme {}", scheme))),
    }
}

impl MediaProcessor {
    pub fn new(
        locator: Arc<dyn AssetLocator>,
        settings: MediaSettings,
        diagnostics: DiagnosticLog,
    ) -> Result<Self, MediaError> {
        let http = Client::builder()
            .user_agent("festival-sync/0.1")
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            locator,
            settings,
            diagnostics,
            memo: Mutex::new(HashMap::new()),
            placeholder_bytes: SyncOnceCell::new(),
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> MediaStats {
        self.counters.snapshot()
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    fn record(&self, entry: DiagnosticEntry) {
        if let Err(err) = self.diagnostics.append(&entry) {
            warn!(%err, "failed to append media diagnostic");
        }
    }

    /// Local path for `req.source_url`. `None` only when the URL is rejected
    /// up front; every later failure yields a placeholder path.
    #[instrument(skip_all, fields(event_id = %req.event_id, asset = ?req.asset))]
    pub async fn process(&self, req: &MediaRequest) -> Option<String> {
        if let Err(err) = check_source_url(&req.source_url) {
            warn!(url = %req.source_url, %err, "image URL rejected");
            Counters::bump(&self.counters.rejected);
            self.record(
                DiagnosticEntry::new(Severity::Warning, &req.source_url, err.reason(), &req.event_id)
                    .with_detail(err.to_string()),
            );
            return None;
        }

        let cell = {
            let mut memo = self.memo.lock().await;
            memo.entry(req.source_url.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut resolved_here = false;
        let path = cell
            .get_or_init(|| async {
                resolved_here = true;
                self.materialize(req).await
            })
            .await
            .clone();
        if !resolved_here {
            Counters::bump(&self.counters.memo_hits);
            debug!(url = %req.source_url, path = %path, "memo hit");
        }
        Some(path)
    }

    async fn materialize(&self, req: &MediaRequest) -> String {
        let id = numeric_suffix(&req.event_id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| req.event_id.clone());

        if !self.settings.force {
            if let Some(found) = self.locator.find_existing(req.kind, req.asset, &id) {
                debug!(path = %found.public, "asset already on disk");
                Counters::bump(&self.counters.reused);
                return found.public;
            }
        }

        let target = self.locator.canonical(req.kind, req.asset, &id);
        match self.fetch_and_transcode(req).await {
            Ok((bytes, warnings)) => {
                for w in warnings {
                    warn!(url = %req.source_url, warning = %w, "image anomaly");
                    self.record(
                        DiagnosticEntry::new(Severity::Warning, &req.source_url, "aspect-ratio", &req.event_id)
                            .with_detail(w),
                    );
                }
                match self.write_asset(&target, &bytes) {
                    Ok(()) => {
                        Counters::bump(&self.counters.processed);
                        info!(path = %target.public, bytes = bytes.len(), "image written");
                        target.public
                    }
                    Err(err) => self.fallback(req, &id, &MediaError::Io(err)),
                }
            }
            Err(err) => self.fallback(req, &id, &err),
        }
    }

    fn fallback(&self, req: &MediaRequest, id: &str, cause: &MediaError) -> String {
        warn!(url = %req.source_url, reason = cause.reason(), err = %cause, "using placeholder");
        Counters::bump(&self.counters.placeholders);
        self.record(
            DiagnosticEntry::new(Severity::Error, &req.source_url, cause.reason(), &req.event_id)
                .with_detail(cause.to_string()),
        );
        let target = self.locator.placeholder(req.kind, req.asset, id);
        let bytes = self
            .placeholder_bytes
            .get_or_init(|| transcode::placeholder(self.settings.placeholder));
        if let Err(err) = self.write_asset(&target, bytes) {
            error!(path = %target.disk.display(), %err, "failed to write placeholder");
        }
        target.public
    }

    fn write_asset(&self, target: &AssetPath, bytes: &[u8]) -> std::io::Result<()> {
        write_atomic(&target.disk, bytes)?;
        if let Some(mirror) = &self.settings.mirror_root {
            write_atomic(&mirror.join(&target.relative), bytes)?;
        }
        Ok(())
    }

    async fn fetch_and_transcode(&self, req: &MediaRequest) -> Result<(Vec<u8>, Vec<String>), MediaError> {
        let res = self.http.get(req.source_url.trim()).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(MediaError::Status(status));
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !transcode::accepts_content_type(content_type.as_deref()) {
            return Err(MediaError::ContentType(content_type.unwrap_or_default()));
        }
        let body = res.bytes().await?;
        if body.is_empty() {
            return Err(MediaError::EmptyBody);
        }

        let kind = transcode::detect_kind(content_type.as_deref(), &req.source_url, &body);
        debug!(?kind, bytes = body.len(), "source fetched");
        let raster = match kind {
            SourceKind::Document => {
                rasterize::rasterize_first_page(&body, &self.settings.converter).await?
            }
            SourceKind::Raster | SourceKind::Icon | SourceKind::Vector => body.to_vec(),
        };

        let (fit, canvas) = match req.asset {
            AssetKind::Speaker => (Fit::CoverTop, self.settings.speaker_canvas),
            AssetKind::Primary => (Fit::Inside, self.settings.canvas),
        };
        tokio::task::spawn_blocking(move || transcode::transcode(&raster, kind, fit, canvas))
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?
    }

    /// Resolve every image reference of `events` in place, with at most
    /// `workers` downloads in flight. Rejected URLs clear the reference.
    /// Returns the assets that resolved to a local file.
    pub async fn process_events(&self, events: &mut [Event]) -> Vec<MediaAsset> {
        let mut jobs: Vec<(usize, MediaRequest)> = Vec::new();
        for (i, event) in events.iter().enumerate() {
            let refs = [
                (AssetKind::Primary, event.image_ref.as_deref()),
                (AssetKind::Speaker, event.speaker_image_ref.as_deref()),
            ];
            for (asset, url) in refs {
                if let Some(url) = url.filter(|u| is_remote(u)) {
                    jobs.push((
                        i,
                        MediaRequest {
                            source_url: url.to_string(),
                            kind: event.kind,
                            event_id: event.id.clone(),
                            asset,
                        },
                    ));
                }
            }
        }

        info!(jobs = jobs.len(), workers = self.settings.workers, "processing images");
        let results: Vec<(usize, MediaRequest, Option<String>)> = stream::iter(jobs)
            .map(|(i, req)| async move {
                let path = self.process(&req).await;
                (i, req, path)
            })
            .buffered(self.settings.workers.max(1))
            .collect()
            .await;

        let mut assets = Vec::with_capacity(results.len());
        for (i, req, path) in results {
            let slot = match req.asset {
                AssetKind::Primary => &mut events[i].image_ref,
                AssetKind::Speaker => &mut events[i].speaker_image_ref,
            };
            *slot = path.clone();
            if let Some(local_path) = path {
                assets.push(MediaAsset {
                    source_url: req.source_url,
                    local_path,
                    kind: req.asset,
                    owner_event_id: req.event_id,
                });
            }
        }
        assets
    }

    /// Prune the diagnostic log and regenerate the report.
    pub fn finish(&self) -> MediaStats {
        let stats = self.stats();
        if let Err(err) = self.diagnostics.prune(chrono::Utc::now()) {
            warn!(%err, "failed to prune media diagnostics");
        }
        match self.diagnostics.write_report(&stats) {
            Ok(path) => info!(report = %path.display(), ?stats, "media run finished"),
            Err(err) => warn!(%err, "failed to write media report"),
        }
        stats
    }
}

/// Anything not already a local path is treated as a remote reference.
fn is_remote(reference: &str) -> bool {
    !reference.trim().is_empty() && !reference.starts_with(locator::PUBLIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_artifacts_and_bad_schemes() {
        assert!(check_source_url("https://cdn.example/a.png").is_ok());
        assert!(matches!(
            check_source_url("logo.png(https://cdn.example/a.png)"),
            Err(MediaError::InvalidUrl(_))
        ));
        assert!(check_source_url("ftp://host/a.png").is_err());
        assert!(check_source_url("   ").is_err());
        assert!(check_source_url("not a url").is_err());
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(MediaError::Status(StatusCode::NOT_FOUND).reason(), "http-status");
        assert_eq!(MediaError::ConversionDisabled.reason(), "conversion-disabled");
        assert_eq!(MediaError::Dimensions { width: 1, height: 1 }.reason(), "dimensions");
    }

    #[test]
    fn local_paths_are_not_remote() {
        assert!(!is_remote("/images/events/talks/talk-1.webp"));
        assert!(is_remote("https://cdn/x.png"));
        assert!(!is_remote(""));
    }
}
