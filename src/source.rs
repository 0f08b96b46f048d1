//! Typed views over the three raw table schemas.
//!
//! The table a row came from decides its variant; nothing here probes field
//! presence to guess a schema.
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::changes::record_key;
use crate::model::{EventKind, RawRecord};

/// Columns shared by every registration form.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CommonFields {
    #[serde(rename = "Choisissez un titre court", default, deserialize_with = "text")]
    pub short_title: Option<String>,
    #[serde(rename = "Jours", default)]
    pub day: Value,
    #[serde(rename = "Espaces", default)]
    pub space: Value,
    #[serde(rename = "Envoyez votre logo", default)]
    pub logo: Value,
    #[serde(rename = "Niveau d'enseignement", default, deserialize_with = "text")]
    pub level: Option<String>,
    #[serde(rename = "Type d'enseignement", default, deserialize_with = "text")]
    pub teaching_type: Option<String>,
    #[serde(rename = "Site internet", default, deserialize_with = "text")]
    pub website: Option<String>,
    #[serde(rename = "Statut", default, deserialize_with = "text")]
    pub status: Option<String>,
    #[serde(rename = "Prénom", default, deserialize_with = "text")]
    pub first_name: Option<String>,
    #[serde(rename = "Nom", default, deserialize_with = "text")]
    pub last_name: Option<String>,
    #[serde(rename = "Organisation", default, deserialize_with = "text")]
    pub organization: Option<String>,
    #[serde(rename = "Email", default, deserialize_with = "text")]
    pub email: Option<String>,
    #[serde(rename = "GSM", default, deserialize_with = "text")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BoothRow {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(
        rename = "Décrivez brièvement votre stand pour les visiteurs",
        default,
        deserialize_with = "text"
    )]
    pub description: Option<String>,
    #[serde(rename = "À qui s'adresse le stand ?", default, deserialize_with = "text")]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WorkshopRow {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(
        rename = "Décrivez brièvement votre animation pour les visiteurs",
        default,
        deserialize_with = "text"
    )]
    pub description: Option<String>,
    #[serde(rename = "À qui s'adresse atelier ?", default, deserialize_with = "text")]
    pub audience: Option<String>,
    #[serde(rename = "Heure", default, deserialize_with = "text")]
    pub time: Option<String>,
    #[serde(rename = "Envoyez une photo de vous", default)]
    pub speaker_photo: Value,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TalkRow {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(
        rename = "Choisissez un titre pour la conférence",
        default,
        deserialize_with = "text"
    )]
    pub talk_title: Option<String>,
    #[serde(rename = "Titre", default)]
    pub legacy_title: Value,
    #[serde(
        rename = "Décrivez brièvement votre conférence pour les visiteurs",
        default,
        deserialize_with = "text"
    )]
    pub description: Option<String>,
    #[serde(rename = "À qui s'adresse conference ?", default, deserialize_with = "text")]
    pub audience: Option<String>,
    #[serde(rename = "Heure", default, deserialize_with = "text")]
    pub time: Option<String>,
    #[serde(rename = "Envoyez une photo de vous", default)]
    pub speaker_photo: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Booth { row_id: String, row: BoothRow },
    Workshop { row_id: String, row: WorkshopRow },
    Talk { row_id: String, row: TalkRow },
}

impl SourceRecord {
    /// Decode a raw row from the table of `kind`. `index` is the row's
    /// position, used as identity when the row carries no id column.
    pub fn from_raw(kind: EventKind, raw: &RawRecord, index: usize) -> Result<Self, serde_json::Error> {
        let row_id = record_key(raw, index);
        Ok(match kind {
            EventKind::Booth => SourceRecord::Booth {
                row_id,
                row: BoothRow::deserialize(raw)?,
            },
            EventKind::Workshop => SourceRecord::Workshop {
                row_id,
                row: WorkshopRow::deserialize(raw)?,
            },
            EventKind::Talk => SourceRecord::Talk {
                row_id,
                row: TalkRow::deserialize(raw)?,
            },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SourceRecord::Booth { .. } => EventKind::Booth,
            SourceRecord::Workshop { .. } => EventKind::Workshop,
            SourceRecord::Talk { .. } => EventKind::Talk,
        }
    }

    pub fn row_id(&self) -> &str {
        match self {
            SourceRecord::Booth { row_id, .. }
            | SourceRecord::Workshop { row_id, .. }
            | SourceRecord::Talk { row_id, .. } => row_id,
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            SourceRecord::Booth { row, .. } => &row.common,
            SourceRecord::Workshop { row, .. } => &row.common,
            SourceRecord::Talk { row, .. } => &row.common,
        }
    }
}

/// Accepts strings, numbers and booleans; blank strings become `None`.
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| value_text(&v)))
}

/// Plain text of a scalar, or of the `Title` of a linked record.
pub fn value_text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => return map.get("Title").and_then(value_text),
        _ => return None,
    };
    Some(s).filter(|s| !s.is_empty())
}

/// URL of the first attachment, preferring the signed download link.
pub fn first_attachment_url(value: &Value) -> Option<String> {
    let first = match value {
        Value::Array(items) => items.first()?.clone(),
        // Some exports store the attachment list as a JSON string.
        Value::String(s) if s.trim_start().starts_with('[') => {
            let items: Vec<Value> = serde_json::from_str(s).ok()?;
            items.into_iter().next()?
        }
        Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
        _ => return None,
    };
    ["signedUrl", "url"]
        .iter()
        .find_map(|k| first.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_workshop_row() {
        let raw = json!({
            "ID": 12,
            "Choisissez un titre court": "  Robots  ",
            "Heure": "14:00:00",
            "GSM": 471234567,
            "Jours": {"Title": "Jeudi"},
            "Envoyez votre logo": [{"signedUrl": "https://cdn/logo.png", "url": "https://x"}],
        });
        let record = SourceRecord::from_raw(EventKind::Workshop, &raw, 0).unwrap();
        assert_eq!(record.row_id(), "12");
        assert_eq!(record.kind(), EventKind::Workshop);
        let SourceRecord::Workshop { row, .. } = record else {
            panic!("wrong variant")
        };
        assert_eq!(row.common.short_title.as_deref(), Some("Robots"));
        assert_eq!(row.time.as_deref(), Some("14:00:00"));
        assert_eq!(row.common.phone.as_deref(), Some("471234567"));
        assert_eq!(
            first_attachment_url(&row.common.logo).as_deref(),
            Some("https://cdn/logo.png")
        );
    }

    #[test]
    fn blank_text_is_none() {
        let raw = json!({"Id": 1, "Choisissez un titre court": "   ", "Nom": null});
        let record = SourceRecord::from_raw(EventKind::Booth, &raw, 0).unwrap();
        assert_eq!(record.common().short_title, None);
        assert_eq!(record.common().last_name, None);
    }

    #[test]
    fn attachment_fallbacks() {
        assert_eq!(
            first_attachment_url(&json!([{"url": "https://a/b.jpg"}])).as_deref(),
            Some("https://a/b.jpg")
        );
        assert_eq!(
            first_attachment_url(&json!(r#"[{"signedUrl":"https://s/x.png"}]"#)).as_deref(),
            Some("https://s/x.png")
        );
        assert_eq!(first_attachment_url(&json!([])), None);
        assert_eq!(first_attachment_url(&Value::Null), None);
    }

    #[test]
    fn linked_record_title() {
        assert_eq!(value_text(&json!({"Title": "Salle A"})).as_deref(), Some("Salle A"));
        assert_eq!(value_text(&json!({"Id": 3})), None);
    }
}
