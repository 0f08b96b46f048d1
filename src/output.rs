//! JSON artifacts consumed by the site build.
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::fsutil::write_json_atomic;
use crate::media::locator::FsAssetLocator;
use crate::model::{Day, Event, EventKind, TimeOfDay};

pub const EVENTS_FILE: &str = "events.json";
pub const EVENTS_BY_DAY_FILE: &str = "events-by-day.json";

/// Events grouped for the schedule pages. Shared booths live in `all_days`
/// only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsByDay {
    pub wednesday: Vec<Event>,
    pub thursday: Vec<Event>,
    pub friday: Vec<Event>,
    pub undetermined: Vec<Event>,
    pub all_days: Vec<Event>,
}

impl EventsByDay {
    pub fn group(events: &[Event]) -> Self {
        let mut out = Self::default();
        for event in events {
            let list = if event.shared {
                &mut out.all_days
            } else {
                match event.day {
                    Day::Wednesday => &mut out.wednesday,
                    Day::Thursday => &mut out.thursday,
                    Day::Friday => &mut out.friday,
                    Day::Undetermined => &mut out.undetermined,
                }
            };
            list.push(event.clone());
        }
        for list in [
            &mut out.wednesday,
            &mut out.thursday,
            &mut out.friday,
            &mut out.undetermined,
            &mut out.all_days,
        ] {
            list.sort_by(schedule_order);
        }
        out
    }

    pub fn for_day(&self, day: Day) -> &[Event] {
        match day {
            Day::Wednesday => &self.wednesday,
            Day::Thursday => &self.thursday,
            Day::Friday => &self.friday,
            Day::Undetermined => &self.undetermined,
        }
    }
}

/// Timed events by start time, then untimed ones: talks, workshops, booths.
pub fn schedule_order(a: &Event, b: &Event) -> Ordering {
    match (&a.start_time, &b.start_time) {
        (TimeOfDay::At(x), TimeOfDay::At(y)) => x.cmp(y),
        (TimeOfDay::At(_), _) => Ordering::Less,
        (_, TimeOfDay::At(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
    .then_with(|| a.kind.untimed_rank().cmp(&b.kind.untimed_rank()))
    .then_with(|| a.title.cmp(&b.title))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSummary {
    pub events: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn generated_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.dir.join(EVENTS_FILE), self.dir.join(EVENTS_BY_DAY_FILE)];
        files.extend(EventKind::ALL.iter().map(|k| self.kind_path(*k)));
        files
    }

    pub fn kind_path(&self, kind: EventKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.plural()))
    }

    /// All generated files exist.
    pub fn outputs_present(&self) -> bool {
        self.generated_files().iter().all(|p| p.is_file())
    }

    /// Delete generated files; raw snapshots are left alone.
    pub fn reset(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in self.generated_files() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        info!(removed, dir = %self.dir.display(), "generated outputs reset");
        Ok(removed)
    }

    pub fn write_all(&self, events: &[Event]) -> io::Result<OutputSummary> {
        let mut summary = OutputSummary {
            events: events.len(),
            files: Vec::new(),
        };

        let flat = self.dir.join(EVENTS_FILE);
        write_json_atomic(&flat, events)?;
        summary.files.push(flat);

        let by_day = self.dir.join(EVENTS_BY_DAY_FILE);
        write_json_atomic(&by_day, &EventsByDay::group(events))?;
        summary.files.push(by_day);

        for kind in EventKind::ALL {
            let subset: Vec<&Event> = events.iter().filter(|e| e.kind == kind).collect();
            let path = self.kind_path(kind);
            write_json_atomic(&path, &subset)?;
            summary.files.push(path);
        }

        info!(events = events.len(), files = summary.files.len(), "outputs written");
        Ok(summary)
    }

    pub fn read_events(&self) -> io::Result<Vec<Event>> {
        let text = fs::read_to_string(self.dir.join(EVENTS_FILE))?;
        serde_json::from_str(&text).map_err(io::Error::other)
    }
}

/// Count image references pointing at files that do not exist.
pub fn verify_assets(events: &[Event], locator: &FsAssetLocator) -> usize {
    let mut missing = 0;
    for event in events {
        for reference in [&event.image_ref, &event.speaker_image_ref].into_iter().flatten() {
            let Some(path) = locator.resolve_public(reference) else {
                continue;
            };
            if !path.is_file() {
                warn!(event_id = %event.id, path = %path.display(), "referenced image missing");
                missing += 1;
            }
        }
    }
    missing
}
