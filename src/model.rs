use serde::{Deserialize, Serialize};
use std::fmt;

/// One row exactly as the table API returned it.
pub type RawRecord = serde_json::Value;

/// Source table a record came from. Doubles as the canonical event type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Booth,
    Workshop,
    Talk,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Booth, EventKind::Workshop, EventKind::Talk];

    /// Prefix used in canonical ids and asset filenames.
    pub fn prefix(&self) -> &'static str {
        match self {
            EventKind::Booth => "booth",
            EventKind::Workshop => "workshop",
            EventKind::Talk => "talk",
        }
    }

    /// Plural name used for table files and asset directories.
    pub fn plural(&self) -> &'static str {
        match self {
            EventKind::Booth => "booths",
            EventKind::Workshop => "workshops",
            EventKind::Talk => "talks",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Booth => "Booth",
            EventKind::Workshop => "Workshop",
            EventKind::Talk => "Talk",
        }
    }

    /// Ordering used inside a day when no time is set: talks, then workshops, then booths.
    pub(crate) fn untimed_rank(&self) -> u8 {
        match self {
            EventKind::Talk => 0,
            EventKind::Workshop => 1,
            EventKind::Booth => 2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Wednesday,
    Thursday,
    Friday,
    Undetermined,
}

impl Day {
    pub const DEFAULT: Day = Day::Wednesday;

    pub fn as_str(&self) -> &'static str {
        match self {
            Day::Wednesday => "wednesday",
            Day::Thursday => "thursday",
            Day::Friday => "friday",
            Day::Undetermined => "undetermined",
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time of day, or one of the two sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeOfDay {
    At(String),
    AllDay,
    Undetermined,
}

impl TimeOfDay {
    pub const ALL_DAY: &'static str = "all-day";
    pub const UNDETERMINED: &'static str = "tbd";

    pub fn as_str(&self) -> &str {
        match self {
            TimeOfDay::At(t) => t,
            TimeOfDay::AllDay => Self::ALL_DAY,
            TimeOfDay::Undetermined => Self::UNDETERMINED,
        }
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            Self::ALL_DAY => TimeOfDay::AllDay,
            Self::UNDETERMINED => TimeOfDay::Undetermined,
            _ => TimeOfDay::At(s),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Published,
    Pending,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub phone: String,
}

/// The canonical festival entry shared by every source table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub day: Day,
    pub start_time: TimeOfDay,
    pub end_time: Option<TimeOfDay>,
    pub location: String,
    pub speaker_name: Option<String>,
    pub organization: Option<String>,
    pub website: Option<String>,
    pub image_ref: Option<String>,
    pub speaker_image_ref: Option<String>,
    pub tags: Vec<String>,
    pub status: PublishStatus,
    pub contact: Contact,
    /// Booths are listed once and shown on every festival day.
    #[serde(default)]
    pub shared: bool,
}

impl Event {
    /// Numeric part of the canonical id (`workshop-12` -> `12`).
    pub fn numeric_id(&self) -> Option<u64> {
        numeric_suffix(&self.id)
    }
}

pub(crate) fn numeric_suffix(id: &str) -> Option<u64> {
    id.rsplit('-').next().and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Primary,
    Speaker,
}

/// A remote image resolved to a file served by the site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub source_url: String,
    pub local_path: String,
    pub kind: AssetKind,
    pub owner_event_id: String,
}
