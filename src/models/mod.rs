//! Record types stored in the cloud collections and in the local mirror
//!
//! Cloud documents arrive as loosely typed JSON. Every record type has a
//! `from_document` constructor that fills defaults and coerces field shapes
//! before deserializing into the fixed Rust type.

mod event;
mod group;
mod user;

pub use event::{Event, EventPatch, NewEvent};
pub use group::{Group, GroupPatch, NewGroup, Weekday};
pub use user::{Role, UserProfile, UserProfilePatch};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Takes a document apart, insisting on a usable `id`.
pub(crate) fn document_fields(document: Value) -> Result<(String, Map<String, Value>)> {
    let mut fields = match document {
        Value::Object(map) => map,
        other => {
            return Err(Error::validation(format!(
                "expected a document object, got {}",
                other
            )))
        }
    };
    let id = match fields.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(Error::validation("document has no id")),
    };
    Ok((id, fields))
}

pub(crate) fn coerce_string(fields: &mut Map<String, Value>, key: &str) {
    let value = match fields.remove(key) {
        Some(Value::String(s)) => Value::String(s),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        Some(Value::Bool(b)) => Value::String(b.to_string()),
        _ => Value::String(String::new()),
    };
    fields.insert(key.to_string(), value);
}

pub(crate) fn coerce_optional_string(fields: &mut Map<String, Value>, key: &str) {
    let value = match fields.remove(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Value::String(s),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        _ => Value::Null,
    };
    fields.insert(key.to_string(), value);
}

pub(crate) fn coerce_u32(fields: &mut Map<String, Value>, key: &str) {
    let number = match fields.remove(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    let clamped = number.unwrap_or(0).min(u32::MAX as u64);
    fields.insert(key.to_string(), Value::from(clamped));
}

pub(crate) fn coerce_bool(fields: &mut Map<String, Value>, key: &str) {
    let flag = match fields.remove(key) {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "sim"),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    };
    fields.insert(key.to_string(), Value::Bool(flag));
}

pub(crate) fn coerce_string_list(fields: &mut Map<String, Value>, key: &str) {
    let list: Vec<Value> = match fields.remove(key) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(Value::String(s)),
                Value::Number(n) => Some(Value::String(n.to_string())),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        _ => Vec::new(),
    };
    fields.insert(key.to_string(), Value::Array(list));
}

pub(crate) fn coerce_timestamp(fields: &mut Map<String, Value>, key: &str) {
    let parsed = match fields.remove(key) {
        Some(Value::String(s)) => parse_timestamp(&s),
        // milliseconds since the epoch
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    };
    let value = parsed
        .map(|ts| Value::String(ts.to_rfc3339()))
        .unwrap_or(Value::Null);
    fields.insert(key.to_string(), value);
}

pub(crate) fn coerce_date(fields: &mut Map<String, Value>, key: &str) {
    let parsed = match fields.remove(key) {
        Some(Value::String(s)) => parse_date(&s),
        _ => None,
    };
    let value = parsed
        .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null);
    fields.insert(key.to_string(), value);
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| n.and_utc()))
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_become_strings() {
        let (id, _) = document_fields(json!({ "id": 42, "titulo": "x" })).unwrap();
        assert_eq!(id, "42");
    }

    #[test]
    fn documents_without_id_are_rejected() {
        assert!(document_fields(json!({ "titulo": "x" })).is_err());
        assert!(document_fields(json!({ "id": "" })).is_err());
        assert!(document_fields(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn numbers_accept_strings_and_clamp_negatives() {
        let mut fields = Map::new();
        fields.insert("a".into(), json!("7"));
        fields.insert("b".into(), json!(-3));
        fields.insert("c".into(), json!(2.0));
        coerce_u32(&mut fields, "a");
        coerce_u32(&mut fields, "b");
        coerce_u32(&mut fields, "c");
        coerce_u32(&mut fields, "missing");
        assert_eq!(fields["a"], json!(7));
        assert_eq!(fields["b"], json!(0));
        assert_eq!(fields["c"], json!(2));
        assert_eq!(fields["missing"], json!(0));
    }

    #[test]
    fn timestamps_accept_rfc3339_dates_and_millis() {
        let mut fields = Map::new();
        fields.insert("a".into(), json!("2024-03-01T10:00:00Z"));
        fields.insert("b".into(), json!("2024-03-01"));
        fields.insert("c".into(), json!(1700000000000i64));
        fields.insert("d".into(), json!("garbage"));
        for key in ["a", "b", "c", "d"] {
            coerce_timestamp(&mut fields, key);
        }
        assert_eq!(fields["a"], json!("2024-03-01T10:00:00+00:00"));
        assert_eq!(fields["b"], json!("2024-03-01T00:00:00+00:00"));
        assert_eq!(fields["c"], json!("2023-11-14T22:13:20+00:00"));
        assert_eq!(fields["d"], Value::Null);
    }
}
