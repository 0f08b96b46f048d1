//! Append-only record of media failures and anomalies, with a Markdown summary.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::fsutil::write_atomic;
use crate::media::MediaStats;

/// Appends between two automatic prunes.
pub const PRUNE_EVERY: usize = 25;

pub const LOG_FILE: &str = "media-diagnostics.jsonl";
pub const REPORT_FILE: &str = "media-report.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source_url: String,
    pub reason: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DiagnosticEntry {
    pub fn new(severity: Severity, source_url: &str, reason: &str, event_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source_url: source_url.to_string(),
            reason: reason.to_string(),
            event_id: event_id.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug)]
pub struct DiagnosticLog {
    dir: PathBuf,
    max_entries: usize,
    max_age: Duration,
    appends: Mutex<usize>,
}

impl DiagnosticLog {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize, max_age_days: i64) -> Self {
        Self {
            dir: dir.into(),
            max_entries,
            max_age: Duration::days(max_age_days),
            appends: Mutex::new(0),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn append(&self, entry: &DiagnosticEntry) -> io::Result<()> {
        let mut appends = self.appends.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.dir)?;
        let mut line = serde_json::to_string(entry).map_err(io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(line.as_bytes())?;

        *appends += 1;
        if *appends % PRUNE_EVERY == 0 {
            self.prune_locked(Utc::now())?;
        }
        Ok(())
    }

    /// Every readable entry, oldest first.
    pub fn entries(&self) -> io::Result<Vec<DiagnosticEntry>> {
        read_entries(&self.log_path())
    }

    /// Keep only the newest `max_entries` entries younger than `max_age`.
    /// Returns how many were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> io::Result<usize> {
        let _guard = self.appends.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_locked(now)
    }

    fn prune_locked(&self, now: DateTime<Utc>) -> io::Result<usize> {
        let path = self.log_path();
        let entries = read_entries(&path)?;
        let before = entries.len();
        let cutoff = now - self.max_age;
        let mut kept: Vec<DiagnosticEntry> =
            entries.into_iter().filter(|e| e.timestamp >= cutoff).collect();
        kept.sort_by_key(|e| e.timestamp);
        if kept.len() > self.max_entries {
            kept.drain(..kept.len() - self.max_entries);
        }
        let dropped = before - kept.len();
        if dropped > 0 {
            let mut body = String::new();
            for entry in &kept {
                body.push_str(&serde_json::to_string(entry).map_err(io::Error::other)?);
                body.push('\n');
            }
            write_atomic(&path, body.as_bytes())?;
            debug!(dropped, kept = kept.len(), "diagnostics pruned");
        }
        Ok(dropped)
    }

    /// Rewrite the Markdown summary from the current log and run stats.
    pub fn write_report(&self, stats: &MediaStats) -> io::Result<PathBuf> {
        let entries = self.entries()?;
        let path = self.report_path();
        write_atomic(&path, render_report(&entries, stats, Utc::now()).as_bytes())?;
        Ok(path)
    }
}

fn read_entries(path: &Path) -> io::Result<Vec<DiagnosticEntry>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match serde_json::from_str(line) {
            Ok(entry) => out.push(entry),
            Err(err) => warn!(line = n + 1, %err, "skipping unreadable diagnostic line"),
        }
    }
    Ok(out)
}

pub fn render_report(entries: &[DiagnosticEntry], stats: &MediaStats, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Media report\n");
    let _ = writeln!(out, "Generated {}\n", now.to_rfc3339());
    let _ = writeln!(out, "## Last run\n");
    let _ = writeln!(out, "| processed | reused | memo hits | placeholders | rejected |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    let _ = writeln!(
        out,
        "| {} | {} | {} | {} | {} |\n",
        stats.processed, stats.reused, stats.memo_hits, stats.placeholders, stats.rejected
    );

    let mut by_reason: BTreeMap<&str, Vec<&DiagnosticEntry>> = BTreeMap::new();
    for entry in entries {
        by_reason.entry(entry.reason.as_str()).or_default().push(entry);
    }
    if by_reason.is_empty() {
        let _ = writeln!(out, "No recorded issues.");
        return out;
    }

    let _ = writeln!(out, "## Issues by reason\n");
    for (reason, items) in by_reason {
        let _ = writeln!(out, "### {} ({})\n", reason, items.len());
        for e in items.iter().rev() {
            let _ = write!(out, "- `{}` {} {}", e.event_id, e.timestamp.format("%Y-%m-%d %H:%M"), e.source_url);
            if let Some(detail) = &e.detail {
                let _ = write!(out, " ({})", detail);
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(age_days: i64, reason: &str, now: DateTime<Utc>) -> DiagnosticEntry {
        let mut e = DiagnosticEntry::new(Severity::Error, "https://x/a.png", reason, "talk-1");
        e.timestamp = now - Duration::days(age_days);
        e
    }

    #[test]
    fn prune_by_age_and_count() {
        let td = tempdir().unwrap();
        let log = DiagnosticLog::new(td.path(), 3, 7);
        let now = Utc::now();
        log.append(&entry(30, "old", now)).unwrap();
        for _ in 0..5 {
            log.append(&entry(1, "recent", now)).unwrap();
        }
        let dropped = log.prune(now).unwrap();
        assert_eq!(dropped, 3);
        let left = log.entries().unwrap();
        assert_eq!(left.len(), 3);
        assert!(left.iter().all(|e| e.reason == "recent"));
    }

    #[test]
    fn prunes_automatically_every_batch() {
        let td = tempdir().unwrap();
        let log = DiagnosticLog::new(td.path(), 10, 7);
        let now = Utc::now();
        for _ in 0..PRUNE_EVERY {
            log.append(&entry(0, "http-status", now)).unwrap();
        }
        assert_eq!(log.entries().unwrap().len(), 10);
    }

    #[test]
    fn report_groups_by_reason() {
        let now = Utc::now();
        let entries = vec![
            entry(0, "http-status", now).with_detail("404 Not Found"),
            entry(0, "decode", now),
            entry(0, "http-status", now),
        ];
        let stats = MediaStats { placeholders: 3, ..Default::default() };
        let md = render_report(&entries, &stats, now);
        assert!(md.contains("### http-status (2)"));
        assert!(md.contains("### decode (1)"));
        assert!(md.contains("(404 Not Found)"));
        assert!(md.contains("| 0 | 0 | 0 | 3 | 0 |"));
    }

    #[test]
    fn write_report_creates_file() {
        let td = tempdir().unwrap();
        let log = DiagnosticLog::new(td.path(), 10, 7);
        let path = log.write_report(&MediaStats::default()).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("No recorded issues."));
    }
}
