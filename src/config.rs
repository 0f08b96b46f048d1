//! Configuration loader and validator for the festival data pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::EventKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub nocodb: NocoDb,
    #[serde(default)]
    pub publication: Publication,
    #[serde(default)]
    pub dedupe: Dedupe,
    pub media: Media,
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Where things are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// JSON outputs and raw snapshots.
    pub data_dir: String,
    /// Directory served by the site; images land under `images/events/`.
    pub public_dir: String,
    /// Second copy of every asset, written outside production builds.
    #[serde(default)]
    pub mirror_dir: Option<String>,
    #[serde(default = "default_primary_branch")]
    pub primary_branch: String,
}

fn default_primary_branch() -> String {
    "main".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NocoDb {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    pub project_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub tables: Tables,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tables {
    pub booths: TableConfig,
    pub workshops: TableConfig,
    pub talks: TableConfig,
}

impl Tables {
    pub fn get(&self, kind: EventKind) -> &TableConfig {
        match kind {
            EventKind::Booth => &self.booths,
            EventKind::Workshop => &self.workshops,
            EventKind::Talk => &self.talks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    pub id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default, rename = "where")]
    pub filter: String,
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publication {
    /// Ignored on production builds of the primary branch, which always hide.
    #[serde(default)]
    pub hide_unpublished: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// 1 - levenshtein(a, b) / max(len(a), len(b)) on lowercased, trimmed titles.
    Levenshtein,
    /// Jaro-Winkler on lowercased, trimmed titles.
    JaroWinkler,
    /// |A ∩ B| / |A ∪ B| over lowercased word sets.
    TokenSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dedupe {
    pub metric: SimilarityMetric,
    pub threshold: f64,
}

impl Default for Dedupe {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::Levenshtein,
            threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub workers: usize,
    pub timeout_secs: u64,
    pub canvas: Canvas,
    pub speaker_canvas: Canvas,
    pub placeholder: Canvas,
    pub converter: Converter,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

/// External rasterizer for vector documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Converter {
    pub enabled: bool,
    pub program: String,
    pub dpi: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostics {
    pub max_entries: usize,
    pub max_age_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_age_secs: u64,
    pub light_check_secs: u64,
    pub debounce_secs: u64,
    pub min_refresh_interval_secs: u64,
    pub backstop_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_age_secs: 3600,
            light_check_secs: 30,
            debounce_secs: 5,
            min_refresh_interval_secs: 60,
            backstop_secs: 900,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
    pub fn light_check(&self) -> Duration {
        Duration::from_secs(self.light_check_secs)
    }
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }
    pub fn backstop(&self) -> Duration {
        Duration::from_secs(self.backstop_secs)
    }
}

impl App {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_path().join("raw-data")
    }

    pub fn images_dir(&self) -> PathBuf {
        Path::new(&self.public_dir).join("images").join("events")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_path().join("logs")
    }
}

impl Config {
    /// Ensure required directories exist.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.data_path())?;
        fs::create_dir_all(self.app.snapshot_dir())?;
        fs::create_dir_all(self.app.images_dir())?;
        Ok(())
    }

    /// Apply `NOCODB_API_TOKEN` / `NOCODB_BASE_URL` when set.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("NOCODB_API_TOKEN") {
            if !token.trim().is_empty() {
                self.nocodb.token = token;
            }
        }
        if let Ok(url) = std::env::var("NOCODB_BASE_URL") {
            if !url.trim().is_empty() {
                self.nocodb.base_url = url;
            }
        }
    }
}

/// Facts about the current build gathered from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildContext {
    pub production: bool,
    pub branch: Option<String>,
}

impl BuildContext {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let is = |k: &str, v: &str| lookup(k).map(|x| x.eq_ignore_ascii_case(v)).unwrap_or(false);
        let production = is("FESTIVAL_ENV", "production")
            || is("NODE_ENV", "production")
            || is("NETLIFY", "true")
            || is("FORCE_PRODUCTION", "true");
        let branch = ["BRANCH", "GIT_BRANCH", "HEAD"]
            .iter()
            .find_map(|k| lookup(k).filter(|b| !b.trim().is_empty()));
        Self { production, branch }
    }

    pub fn is_primary_production(&self, primary_branch: &str) -> bool {
        self.production && self.branch.as_deref() == Some(primary_branch)
    }

    /// Production builds of the primary branch always hide unpublished rows.
    pub fn hide_unpublished(&self, cfg: &Config) -> bool {
        if self.is_primary_production(&cfg.app.primary_branch) {
            return true;
        }
        cfg.publication.hide_unpublished.unwrap_or(self.production)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.public_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.public_dir must be non-empty"));
    }
    if cfg.app.primary_branch.trim().is_empty() {
        return Err(ConfigError::Invalid("app.primary_branch must be non-empty"));
    }

    if cfg.nocodb.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("nocodb.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.nocodb.base_url).is_err() {
        return Err(ConfigError::Invalid("nocodb.base_url must be a valid URL"));
    }
    if cfg.nocodb.project_id.trim().is_empty() {
        return Err(ConfigError::Invalid("nocodb.project_id must be non-empty"));
    }
    if cfg.nocodb.timeout_secs == 0 {
        return Err(ConfigError::Invalid("nocodb.timeout_secs must be > 0"));
    }
    for kind in EventKind::ALL {
        let table = cfg.nocodb.tables.get(kind);
        if table.id.trim().is_empty() {
            return Err(ConfigError::Invalid("nocodb.tables.*.id must be non-empty"));
        }
        if table.page_size == 0 {
            return Err(ConfigError::Invalid("nocodb.tables.*.page_size must be > 0"));
        }
    }

    if !(0.0..=1.0).contains(&cfg.dedupe.threshold) {
        return Err(ConfigError::Invalid("dedupe.threshold must be within 0..=1"));
    }

    let m = &cfg.media;
    if m.workers == 0 {
        return Err(ConfigError::Invalid("media.workers must be > 0"));
    }
    if m.timeout_secs == 0 {
        return Err(ConfigError::Invalid("media.timeout_secs must be > 0"));
    }
    for canvas in [m.canvas, m.speaker_canvas, m.placeholder] {
        if canvas.width == 0 || canvas.height == 0 {
            return Err(ConfigError::Invalid("media canvas sizes must be > 0"));
        }
    }
    if m.converter.enabled && m.converter.program.trim().is_empty() {
        return Err(ConfigError::Invalid("media.converter.program must be non-empty"));
    }
    if m.converter.dpi == 0 || m.converter.timeout_secs == 0 {
        return Err(ConfigError::Invalid("media.converter dpi and timeout_secs must be > 0"));
    }
    if m.diagnostics.max_entries == 0 {
        return Err(ConfigError::Invalid("media.diagnostics.max_entries must be > 0"));
    }

    let c = &cfg.cache;
    if c.ttl_secs == 0 || c.max_age_secs == 0 {
        return Err(ConfigError::Invalid("cache.ttl_secs and cache.max_age_secs must be > 0"));
    }
    if c.light_check_secs == 0 || c.backstop_secs == 0 {
        return Err(ConfigError::Invalid("cache intervals must be > 0"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./src/content/festival"
  public_dir: "./public"
  mirror_dir: "./src/assets/images/events"
  primary_branch: "main"

nocodb:
  base_url: "https://app.nocodb.com"
  token: "YOUR_NOCODB_API_TOKEN"
  project_id: "NOCODB_PROJECT_ID"
  timeout_secs: 30
  tables:
    booths:
      id: "NOCODB_BOOTHS_TABLE_ID"
      page_size: 100
    workshops:
      id: "NOCODB_WORKSHOPS_TABLE_ID"
      page_size: 50
    talks:
      id: "NOCODB_TALKS_TABLE_ID"
      page_size: 50

publication:
  hide_unpublished: false

dedupe:
  metric: levenshtein
  threshold: 0.9

media:
  workers: 4
  timeout_secs: 20
  canvas:
    width: 400
    height: 400
  speaker_canvas:
    width: 400
    height: 400
  placeholder:
    width: 400
    height: 400
  converter:
    enabled: true
    program: "pdftoppm"
    dpi: 300
    timeout_secs: 60
  diagnostics:
    max_entries: 100
    max_age_days: 7

cache:
  ttl_secs: 300
  max_age_secs: 3600
  light_check_secs: 30
  debounce_secs: 5
  min_refresh_interval_secs: 60
  backstop_secs: 900
"#
}
