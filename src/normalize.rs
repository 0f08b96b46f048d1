//! Raw rows to canonical events.
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::model::{Contact, Day, Event, EventKind, PublishStatus, RawRecord, TimeOfDay};
use crate::source::{first_attachment_url, value_text, CommonFields, SourceRecord};

/// Words kept when a description stands in for a missing title.
pub const TITLE_WORDS: usize = 5;

/// Location of an event whose space is not assigned yet.
pub const LOCATION_UNDETERMINED: &str = "tbd";

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,2})\s*[:hH]\s*(\d{2})").expect("valid time regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub hide_unpublished: bool,
}

/// Convert every row of one table, dropping unpublished rows when asked.
pub fn normalize_rows(kind: EventKind, rows: &[RawRecord], opts: NormalizeOptions) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut events = Vec::with_capacity(rows.len());
    let mut hidden = 0usize;

    for (index, raw) in rows.iter().enumerate() {
        let record = match SourceRecord::from_raw(kind, raw, index) {
            Ok(r) => r,
            Err(err) => {
                warn!(table = kind.plural(), index, %err, "row skipped, unreadable");
                continue;
            }
        };
        let event = to_event(&record);
        if opts.hide_unpublished && event.status != PublishStatus::Published {
            hidden += 1;
            continue;
        }
        if !seen.insert(event.id.clone()) {
            warn!(event_id = %event.id, "duplicate row id, keeping the first");
            continue;
        }
        events.push(event);
    }

    info!(table = kind.plural(), events = events.len(), hidden, "rows normalized");
    events
}

/// Adapt one decoded record into the canonical shape.
pub fn to_event(record: &SourceRecord) -> Event {
    let kind = record.kind();
    let id = format!("{}-{}", kind.prefix(), record.row_id());
    let common = record.common();
    let speaker_name = speaker_name(common);

    let (title, description, audience, start_time, speaker_image_ref, shared) = match record {
        SourceRecord::Booth { row, .. } => (
            common.short_title.clone(),
            row.description.clone(),
            row.audience.clone(),
            TimeOfDay::AllDay,
            None,
            true,
        ),
        SourceRecord::Workshop { row, .. } => (
            common.short_title.clone(),
            row.description.clone(),
            row.audience.clone(),
            format_time(row.time.as_deref()),
            first_attachment_url(&row.speaker_photo),
            false,
        ),
        SourceRecord::Talk { row, .. } => (
            row.talk_title
                .clone()
                .or_else(|| common.short_title.clone())
                .or_else(|| value_text(&row.legacy_title)),
            row.description.clone(),
            row.audience.clone(),
            format_time(row.time.as_deref()),
            first_attachment_url(&row.speaker_photo),
            false,
        ),
    };
    let description = description.unwrap_or_default();
    let title = title.unwrap_or_else(|| {
        backfill_title(kind, record.row_id(), speaker_name.as_deref(), &description)
    });

    Event {
        id,
        title,
        description,
        kind,
        day: parse_day(&common.day),
        start_time,
        end_time: None,
        location: value_text(&common.space).unwrap_or_else(|| LOCATION_UNDETERMINED.to_string()),
        speaker_name,
        organization: common.organization.clone(),
        website: common.website.clone(),
        image_ref: first_attachment_url(&common.logo),
        speaker_image_ref,
        tags: collect_tags(&[
            audience.as_deref(),
            common.level.as_deref(),
            common.teaching_type.as_deref(),
        ]),
        status: parse_status(common.status.as_deref()),
        contact: Contact {
            email: common.email.clone().unwrap_or_default(),
            phone: common.phone.clone().unwrap_or_default(),
        },
        shared,
    }
}

fn speaker_name(common: &CommonFields) -> Option<String> {
    let name = [common.first_name.as_deref(), common.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    Some(name).filter(|n| !n.trim().is_empty())
}

/// Title for a row whose title columns are all blank.
pub fn backfill_title(kind: EventKind, row_id: &str, speaker: Option<&str>, description: &str) -> String {
    if let Some(speaker) = speaker.map(str::trim).filter(|s| !s.is_empty()) {
        return speaker.to_string();
    }
    let words: Vec<&str> = description.split_whitespace().collect();
    if !words.is_empty() {
        let mut title = words[..words.len().min(TITLE_WORDS)].join(" ");
        if words.len() > TITLE_WORDS {
            title.push('…');
        }
        return title;
    }
    format!("{} #{}", kind.label(), row_id)
}

/// Lowercase and strip the accents found in French day and status labels.
fn fold(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

fn day_from_code(code: i64) -> Day {
    match code {
        1 => Day::Wednesday,
        2 => Day::Thursday,
        3 => Day::Friday,
        // "all three days"
        0 => Day::DEFAULT,
        other => {
            warn!(code = other, default = %Day::DEFAULT, "unknown day code");
            Day::DEFAULT
        }
    }
}

/// Map a day column (code, linked record or free text) onto the festival days.
pub fn parse_day(value: &Value) -> Day {
    match value {
        Value::Null => Day::Undetermined,
        Value::Number(n) => match n.as_i64() {
            Some(code) => day_from_code(code),
            None => {
                warn!(value = %n, default = %Day::DEFAULT, "unrecognized day");
                Day::DEFAULT
            }
        },
        Value::Object(map) => match map.get("Title") {
            Some(title) => parse_day(title),
            None => {
                warn!(default = %Day::DEFAULT, "day record without title");
                Day::DEFAULT
            }
        },
        Value::String(s) => parse_day_text(s),
        other => {
            warn!(value = %other, default = %Day::DEFAULT, "unrecognized day");
            Day::DEFAULT
        }
    }
}

fn parse_day_text(raw: &str) -> Day {
    let folded = fold(raw);
    if folded.is_empty() {
        return Day::Undetermined;
    }
    if let Ok(code) = folded.parse::<i64>() {
        return day_from_code(code);
    }
    match folded.as_str() {
        "mercredi" | "wednesday" | "wed" | "mer" => Day::Wednesday,
        "jeudi" | "thursday" | "thu" | "jeu" => Day::Thursday,
        "vendredi" | "friday" | "fri" | "ven" => Day::Friday,
        "a definir" | "tbd" | "to be determined" | "undetermined" => Day::Undetermined,
        "les trois jours" | "tous les jours" | "all days" => Day::DEFAULT,
        _ => {
            warn!(value = raw, default = %Day::DEFAULT, "unrecognized day");
            Day::DEFAULT
        }
    }
}

/// `HH:MM[:SS]` to `HH:MM`; blank or placeholder text is undetermined.
pub fn format_time(raw: Option<&str>) -> TimeOfDay {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return TimeOfDay::Undetermined;
    };
    match TIME_RE.captures(raw) {
        Some(caps) => {
            let hours: u32 = caps[1].parse().unwrap_or(0);
            TimeOfDay::At(format!("{:02}:{}", hours, &caps[2]))
        }
        None => {
            if fold(raw) != "a definir" {
                warn!(value = raw, "unrecognized time");
            }
            TimeOfDay::Undetermined
        }
    }
}

/// Split comma-separated values, trim, and drop blanks and repeats.
pub fn collect_tags(fields: &[Option<&str>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for value in fields.iter().flatten() {
        for tag in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if seen.insert(tag.to_string()) {
                tags.push(tag.to_string());
            }
        }
    }
    tags
}

fn parse_status(raw: Option<&str>) -> PublishStatus {
    match raw.map(fold).as_deref() {
        Some("publie") | Some("published") => PublishStatus::Published,
        other => {
            debug!(status = ?other, "row not published");
            PublishStatus::Pending
        }
    }
}
