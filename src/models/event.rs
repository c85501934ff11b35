use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{coerce_date, coerce_optional_string, coerce_string, coerce_timestamp, document_fields};
use crate::error::{Error, Result};

/// Calendar event (`eventos` collection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Event {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "data")]
    pub date: Option<NaiveDate>,
    #[serde(rename = "local")]
    pub location: String,
    #[serde(rename = "organizador")]
    pub organizer: String,
    /// `HH:MM`
    #[serde(rename = "horaInicio")]
    pub start_time: Option<String>,
    /// `HH:MM`
    #[serde(rename = "horaFim")]
    pub end_time: Option<String>,
    #[serde(rename = "teatroId")]
    pub group_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn from_document(document: Value) -> Result<Event> {
        let (id, mut fields) = document_fields(document)?;

        for key in ["titulo", "descricao", "local", "organizador"] {
            coerce_string(&mut fields, key);
        }
        for key in ["horaInicio", "horaFim", "teatroId"] {
            coerce_optional_string(&mut fields, key);
        }
        coerce_date(&mut fields, "data");
        coerce_timestamp(&mut fields, "createdAt");
        coerce_timestamp(&mut fields, "updatedAt");

        let mut event: Event = serde_json::from_value(Value::Object(fields))?;
        event.id = id;
        // Malformed times are dropped rather than trusted.
        if event.start_time.as_deref().and_then(parse_time).is_none() {
            event.start_time = None;
        }
        if event.end_time.as_deref().and_then(parse_time).is_none() {
            event.end_time = None;
        }
        Ok(event)
    }

    pub fn starts_at(&self) -> Option<NaiveTime> {
        self.start_time.as_deref().and_then(parse_time)
    }

    pub fn is_on(&self, day: NaiveDate) -> bool {
        self.date == Some(day)
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub(crate) fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .ok()
}

fn validate_times(start: Option<&str>, end: Option<&str>) -> Result<()> {
    let start = match start {
        Some(raw) => Some(
            parse_time(raw).ok_or_else(|| Error::validation(format!("invalid start time: {}", raw)))?,
        ),
        None => None,
    };
    let end = match end {
        Some(raw) => Some(
            parse_time(raw).ok_or_else(|| Error::validation(format!("invalid end time: {}", raw)))?,
        ),
        None => None,
    };
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(Error::validation("end time is before start time"));
        }
    }
    Ok(())
}

/// Fields supplied when an event is created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub date: Option<NaiveDate>,
    pub location: String,
    pub organizer: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub group_id: Option<String>,
}

impl NewEvent {
    pub fn new(title: &str, date: NaiveDate) -> Self {
        Self {
            title: title.to_string(),
            date: Some(date),
            ..Default::default()
        }
    }

    pub fn with_times(mut self, start: &str, end: Option<&str>) -> Self {
        self.start_time = Some(start.to_string());
        self.end_time = end.map(str::to_string);
        self
    }

    pub fn for_group(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title is required"));
        }
        if self.date.is_none() {
            return Err(Error::validation("date is required"));
        }
        validate_times(self.start_time.as_deref(), self.end_time.as_deref())
    }

    pub fn into_event(self, now: DateTime<Utc>) -> Event {
        Event {
            id: String::new(),
            title: self.title.trim().to_string(),
            description: self.description,
            date: self.date,
            location: self.location,
            organizer: self.organizer,
            start_time: self.start_time,
            end_time: self.end_time,
            group_id: self.group_id,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

/// Partial update of an event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventPatch {
    #[serde(rename = "titulo", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "descricao", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(rename = "local", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "organizador", skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(rename = "horaInicio", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "horaFim", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EventPatch {
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.title, Some(t) if t.trim().is_empty()) {
            return Err(Error::validation("title cannot be blank"));
        }
        validate_times(self.start_time.as_deref(), self.end_time.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        *self == EventPatch::default()
    }

    pub fn apply_to(&self, event: &mut Event) {
        if let Some(v) = &self.title {
            event.title = v.clone();
        }
        if let Some(v) = &self.description {
            event.description = v.clone();
        }
        if let Some(v) = self.date {
            event.date = Some(v);
        }
        if let Some(v) = &self.location {
            event.location = v.clone();
        }
        if let Some(v) = &self.organizer {
            event.organizer = v.clone();
        }
        if let Some(v) = &self.start_time {
            event.start_time = Some(v.clone());
        }
        if let Some(v) = &self.end_time {
            event.end_time = Some(v.clone());
        }
        if let Some(v) = self.updated_at {
            event.updated_at = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_document_defaults_and_drops_bad_times() {
        let event = Event::from_document(json!({
            "id": "e1",
            "titulo": "Estreia",
            "data": "2024-12-01",
            "horaInicio": "19:30",
            "horaFim": "later",
            "teatroId": ""
        }))
        .unwrap();

        assert_eq!(event.date, NaiveDate::from_ymd_opt(2024, 12, 1));
        assert_eq!(event.start_time.as_deref(), Some("19:30"));
        assert_eq!(event.end_time, None);
        assert_eq!(event.group_id, None);
        assert_eq!(event.organizer, "");
        assert_eq!(event.starts_at(), NaiveTime::from_hms_opt(19, 30, 0));
    }

    #[test]
    fn new_event_validation() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        assert!(NewEvent::new("Ensaio geral", date).validate().is_ok());
        assert!(NewEvent::new("", date).validate().is_err());
        assert!(NewEvent {
            title: "Sem data".into(),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(NewEvent::new("x", date)
            .with_times("20:00", Some("19:00"))
            .validate()
            .is_err());
        assert!(NewEvent::new("x", date)
            .with_times("8pm", None)
            .validate()
            .is_err());
    }

    #[test]
    fn patch_validation() {
        let blank = EventPatch {
            title: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
        assert!(EventPatch::default().is_empty());
    }
}
