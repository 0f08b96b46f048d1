//! Serve-time event cache: per-table datasets kept warm by cheap count polls
//! and rate-limited full refreshes.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::cache::{Cache, CachePolicy, Refresh};
use crate::config::{CacheSettings, Config};
use crate::dedupe::DuplicateResolver;
use crate::fetcher::{fetch_all, TableSpec};
use crate::model::{Event, EventKind};
use crate::nocodb::{FetchError, TableService};
use crate::normalize::{normalize_rows, NormalizeOptions};

/// One cached dataset per source table.
pub type Dataset = EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Manual,
    CountMismatch,
    Backstop,
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefreshReason::Manual => "manual",
            RefreshReason::CountMismatch => "count-mismatch",
            RefreshReason::Backstop => "backstop",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Skipped: the previous full refresh is too recent.
    RateLimited,
    /// Skipped: a full refresh is already running.
    InFlight,
}

pub struct CacheManager {
    service: Arc<dyn TableService>,
    cfg: Arc<Config>,
    normalize: NormalizeOptions,
    settings: CacheSettings,
    cache: Cache<Dataset, Vec<Event>>,
    last_full_refresh: Mutex<Option<Instant>>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("settings", &self.settings)
            .field("normalize", &self.normalize)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(service: Arc<dyn TableService>, cfg: Arc<Config>, hide_unpublished: bool) -> Self {
        let settings = cfg.cache.clone();
        let cache = Cache::new(CachePolicy::new(settings.ttl(), settings.max_age()));
        Self {
            service,
            cfg,
            normalize: NormalizeOptions { hide_unpublished },
            settings,
            cache,
            last_full_refresh: Mutex::new(None),
        }
    }

    fn spec(&self, kind: Dataset) -> TableSpec {
        TableSpec::for_kind(kind, self.cfg.nocodb.tables.get(kind))
    }

    /// Fetch, normalize and dedupe one table; returns the events and the raw
    /// row count they came from.
    async fn load(&self, kind: Dataset) -> Result<(Vec<Event>, u64), FetchError> {
        let rows = fetch_all(self.service.as_ref(), &self.spec(kind)).await?;
        let count = rows.len() as u64;
        let events = normalize_rows(kind, &rows, self.normalize);
        let events = DuplicateResolver::from_config(&self.cfg.dedupe).resolve(events).events;
        Ok((events, count))
    }

    /// Events of one table, from cache when fresh. Serves stale data rather
    /// than an error whenever any cached copy exists.
    pub async fn get(&self, kind: Dataset) -> Result<Arc<Vec<Event>>, FetchError> {
        self.cache.get_with(&kind, || self.load(kind)).await
    }

    /// Every table's events, booths first.
    pub async fn all_events(&self) -> Result<Vec<Event>, FetchError> {
        let mut all = Vec::new();
        for kind in EventKind::ALL {
            all.extend(self.get(kind).await?.iter().cloned());
        }
        Ok(all)
    }

    pub async fn force_refresh(&self, kind: Dataset) {
        self.cache.force_refresh(&kind).await;
    }

    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all().await;
    }

    /// Compare remote row counts with the cached ones. Returns true when any
    /// cached table no longer matches. Skipped while a refresh is running.
    #[instrument(skip_all)]
    pub async fn light_check(&self) -> Result<bool, FetchError> {
        if self.cache.refreshing().await {
            debug!("refresh in flight, light check skipped");
            return Ok(false);
        }
        let mut changed = false;
        for (kind, cached) in self.cache.counts().await {
            let spec = self.spec(kind);
            let remote = self
                .service
                .count_rows(&spec.id, spec.filter.as_deref())
                .await?;
            if remote != cached {
                info!(table = %spec.name, cached, remote, "row count changed");
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Reload every table, at most once per `min_refresh_interval`. A failed
    /// table keeps its previous data; the first error is returned.
    #[instrument(skip(self))]
    pub async fn full_refresh(&self, reason: RefreshReason) -> Result<RefreshOutcome, FetchError> {
        let Ok(mut last) = self.last_full_refresh.try_lock() else {
            return Ok(RefreshOutcome::InFlight);
        };
        if let Some(at) = *last {
            if at.elapsed() < self.settings.min_refresh_interval() {
                debug!(since = ?at.elapsed(), "full refresh rate limited");
                return Ok(RefreshOutcome::RateLimited);
            }
        }
        *last = Some(Instant::now());

        let mut first_err = None;
        for kind in EventKind::ALL {
            match self.cache.refresh_with(&kind, || self.load(kind)).await {
                Ok(Refresh::Done) => {}
                Ok(Refresh::InFlight) => debug!(table = kind.plural(), "table refresh already running"),
                Err(err) => {
                    warn!(table = kind.plural(), %err, "table refresh failed, keeping cached data");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                info!(%reason, "full refresh complete");
                Ok(RefreshOutcome::Refreshed)
            }
        }
    }

    /// Run light checks and the backstop refresh until `shutdown` flips.
    pub fn spawn_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut light = interval(self.settings.light_check());
            light.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let backstop_every = self.settings.backstop();
            let mut backstop = interval_at(Instant::now() + backstop_every, backstop_every);
            backstop.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let debounce: Duration = self.settings.debounce();

            info!("cache scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = light.tick() => {
                        match self.light_check().await {
                            Ok(true) => {
                                tokio::select! {
                                    _ = shutdown.changed() => break,
                                    _ = tokio::time::sleep(debounce) => {}
                                }
                                if let Err(err) = self.full_refresh(RefreshReason::CountMismatch).await {
                                    warn!(%err, "refresh after count change failed");
                                }
                            }
                            Ok(false) => {}
                            Err(err) => warn!(%err, "light check failed"),
                        }
                    }
                    _ = backstop.tick() => {
                        if let Err(err) = self.full_refresh(RefreshReason::Backstop).await {
                            warn!(%err, "backstop refresh failed");
                        }
                    }
                }
            }
            info!("cache scheduler stopped");
        })
    }
}
