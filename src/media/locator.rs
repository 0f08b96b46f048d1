//! Where assets live on disk, and which older names still count as present.
use std::path::{Path, PathBuf};

use crate::model::{AssetKind, EventKind};

/// Public URL prefix of the images directory.
pub const PUBLIC_PREFIX: &str = "/images/events";

const LEGACY_RASTER_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
const LEGACY_DAYS: [&str; 3] = ["Mercredi", "Jeudi", "Vendredi"];

/// A file under the images root, addressed both on disk and publicly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPath {
    /// Path relative to the images root, e.g. `workshops/workshop-3.webp`.
    pub relative: PathBuf,
    pub disk: PathBuf,
    pub public: String,
}

pub trait AssetLocator: Send + Sync {
    /// Where a freshly processed asset is written.
    fn canonical(&self, kind: EventKind, asset: AssetKind, id: &str) -> AssetPath;

    /// Where a fallback image is written. Never returned by `find_existing`,
    /// so failed sources are retried on the next run.
    fn placeholder(&self, kind: EventKind, asset: AssetKind, id: &str) -> AssetPath;

    /// First already-materialized file for this asset, canonical name first.
    fn find_existing(&self, kind: EventKind, asset: AssetKind, id: &str) -> Option<AssetPath>;
}

/// Older French names for the per-kind prefix and directory.
fn legacy_prefix(kind: EventKind) -> (&'static str, &'static str) {
    match kind {
        EventKind::Booth => ("stand", "stands"),
        EventKind::Workshop => ("atelier", "ateliers"),
        EventKind::Talk => ("conference", "conferences"),
    }
}

fn file_prefix(kind: EventKind, asset: AssetKind) -> &'static str {
    match asset {
        AssetKind::Primary => kind.prefix(),
        AssetKind::Speaker => "speaker",
    }
}

/// Legacy names probed after the canonical one, as `(dir, file)` pairs.
pub fn legacy_candidates(kind: EventKind, asset: AssetKind, id: &str) -> Vec<(String, String)> {
    let (fr_prefix, fr_dir) = legacy_prefix(kind);
    let prefixes = [kind.prefix(), fr_prefix];
    let mut stems: Vec<String> = Vec::new();
    let dirs: Vec<&str> = match asset {
        AssetKind::Speaker => {
            for p in prefixes {
                stems.push(format!("speaker-{}-{}", p, id));
            }
            vec![kind.plural(), "speakers", fr_dir]
        }
        AssetKind::Primary => {
            for p in prefixes {
                stems.push(format!("{}-{}", p, id));
                stems.push(format!("event-{}-{}", p, id));
                stems.push(format!("{}-{}-{}", p, p, id));
            }
            if kind == EventKind::Booth {
                for p in prefixes {
                    for day in LEGACY_DAYS {
                        stems.push(format!("{}-{}-{}", p, id, day));
                        stems.push(format!("event-{}-{}-{}", p, id, day));
                        stems.push(format!("{}-{}-{}-{}", p, p, id, day));
                        stems.push(format!("{}-{}-{}-{}-{}", p, p, id, day, day));
                    }
                }
            }
            vec![kind.plural(), fr_dir]
        }
    };
    if asset == AssetKind::Speaker {
        stems.insert(0, format!("speaker-{}", id));
    }

    let mut out = Vec::new();
    for ext in std::iter::once("webp").chain(LEGACY_RASTER_EXTS) {
        for dir in &dirs {
            for stem in &stems {
                out.push((dir.to_string(), format!("{}.{}", stem, ext)));
            }
        }
    }
    let canonical = canonical_parts(kind, asset, id);
    out.retain(|c| *c != canonical);
    out
}

fn canonical_parts(kind: EventKind, asset: AssetKind, id: &str) -> (String, String) {
    (
        kind.plural().to_string(),
        format!("{}-{}.webp", file_prefix(kind, asset), id),
    )
}

#[derive(Debug, Clone)]
pub struct FsAssetLocator {
    root: PathBuf,
}

impl FsAssetLocator {
    /// `root` is the images directory served at [`PUBLIC_PREFIX`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, dir: &str, file: &str) -> AssetPath {
        let relative = Path::new(dir).join(file);
        AssetPath {
            disk: self.root.join(&relative),
            public: format!("{}/{}/{}", PUBLIC_PREFIX, dir, file),
            relative,
        }
    }

    /// Map a public path produced by this locator back to its file.
    pub fn resolve_public(&self, public: &str) -> Option<PathBuf> {
        let rest = public.strip_prefix(PUBLIC_PREFIX)?.trim_start_matches('/');
        if rest.is_empty() || rest.split('/').any(|part| part == "..") {
            return None;
        }
        Some(self.root.join(rest))
    }
}

fn is_materialized(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

impl AssetLocator for FsAssetLocator {
    fn canonical(&self, kind: EventKind, asset: AssetKind, id: &str) -> AssetPath {
        let (dir, file) = canonical_parts(kind, asset, id);
        self.path(&dir, &file)
    }

    fn placeholder(&self, kind: EventKind, asset: AssetKind, id: &str) -> AssetPath {
        let (dir, file) = canonical_parts(kind, asset, id);
        self.path(&dir, &format!("placeholder-{}", file))
    }

    fn find_existing(&self, kind: EventKind, asset: AssetKind, id: &str) -> Option<AssetPath> {
        let canonical = self.canonical(kind, asset, id);
        if is_materialized(&canonical.disk) {
            return Some(canonical);
        }
        legacy_candidates(kind, asset, id)
            .into_iter()
            .map(|(dir, file)| self.path(&dir, &file))
            .find(|p| is_materialized(&p.disk))
    }
}
