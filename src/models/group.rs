use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use super::{
    coerce_bool, coerce_date, coerce_string, coerce_string_list, coerce_timestamp, coerce_u32,
    document_fields, parse_date,
};
use crate::error::{Error, Result};

/// Rehearsal day token as stored in `diasEnsaio`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    #[serde(rename = "Domingo")]
    Sunday,
    #[serde(rename = "Segunda")]
    Monday,
    #[serde(rename = "Terça")]
    Tuesday,
    #[serde(rename = "Quarta")]
    Wednesday,
    #[serde(rename = "Quinta")]
    Thursday,
    #[serde(rename = "Sexta")]
    Friday,
    #[serde(rename = "Sábado")]
    Saturday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Sunday,
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Weekday::Sunday => "Domingo",
            Weekday::Monday => "Segunda",
            Weekday::Tuesday => "Terça",
            Weekday::Wednesday => "Quarta",
            Weekday::Thursday => "Quinta",
            Weekday::Friday => "Sexta",
            Weekday::Saturday => "Sábado",
        }
    }

    /// Parses a day token; accepts the unaccented spellings and a
    /// trailing `-feira`.
    pub fn parse(raw: &str) -> Option<Weekday> {
        let lowered = raw.trim().to_lowercase();
        let base = lowered.strip_suffix("-feira").unwrap_or(&lowered);
        match base {
            "domingo" => Some(Weekday::Sunday),
            "segunda" => Some(Weekday::Monday),
            "terça" | "terca" => Some(Weekday::Tuesday),
            "quarta" => Some(Weekday::Wednesday),
            "quinta" => Some(Weekday::Thursday),
            "sexta" => Some(Weekday::Friday),
            "sábado" | "sabado" => Some(Weekday::Saturday),
            _ => None,
        }
    }

    /// Sorted, deduplicated list of the recognised tokens.
    pub fn normalize<'a, I: IntoIterator<Item = &'a str>>(tokens: I) -> Vec<Weekday> {
        let mut days: Vec<Weekday> = tokens.into_iter().filter_map(Weekday::parse).collect();
        days.sort();
        days.dedup();
        days
    }

    pub fn from_chrono(day: chrono::Weekday) -> Weekday {
        match day {
            chrono::Weekday::Sun => Weekday::Sunday,
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Theater group (`teatros` collection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Group {
    /// Cloud document id, or a `local_` id for records not yet synced.
    /// Left out of the document when empty so the cloud assigns one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "local")]
    pub location: String,
    #[serde(rename = "diasEnsaio")]
    pub rehearsal_days: Vec<Weekday>,
    #[serde(rename = "dataApresentacao")]
    pub presentation_date: Option<NaiveDate>,
    #[serde(rename = "roteiro")]
    pub script: String,
    #[serde(rename = "cenario")]
    pub scenery: String,
    #[serde(rename = "figurino")]
    pub costumes: String,
    #[serde(rename = "numeroCenas")]
    pub scene_count: u32,
    #[serde(rename = "numeroAtos")]
    pub act_count: u32,
    #[serde(rename = "numeroAtores")]
    pub actor_count: u32,
    #[serde(rename = "numeroFigurinos")]
    pub costume_count: u32,
    #[serde(rename = "criador")]
    pub creator: String,
    #[serde(rename = "participantes")]
    pub participants: Vec<String>,
    #[serde(rename = "alerta")]
    pub alert: bool,
    #[serde(rename = "mensagemAlerta")]
    pub alert_message: String,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Group {
    /// Builds a group from a cloud or mirror document, defaulting every
    /// missing field and coercing loosely typed values.
    pub fn from_document(document: Value) -> Result<Group> {
        let (id, mut fields) = document_fields(document)?;

        for key in [
            "titulo",
            "descricao",
            "local",
            "roteiro",
            "cenario",
            "figurino",
            "criador",
            "mensagemAlerta",
        ] {
            coerce_string(&mut fields, key);
        }
        for key in ["numeroCenas", "numeroAtos", "numeroAtores", "numeroFigurinos"] {
            coerce_u32(&mut fields, key);
        }
        coerce_bool(&mut fields, "alerta");
        coerce_string_list(&mut fields, "participantes");
        coerce_string_list(&mut fields, "diasEnsaio");
        coerce_date(&mut fields, "dataApresentacao");
        coerce_timestamp(&mut fields, "createdAt");
        coerce_timestamp(&mut fields, "updatedAt");

        let days: Vec<&str> = fields
            .get("diasEnsaio")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let days = Weekday::normalize(days);
        fields.insert("diasEnsaio".to_string(), serde_json::to_value(days)?);

        let mut group: Group = serde_json::from_value(Value::Object(fields))?;
        group.id = id;
        group.ensure_creator_participant();
        Ok(group)
    }

    /// Keeps the creator in the participant list and drops duplicates.
    pub fn ensure_creator_participant(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.participants.retain(|p| seen.insert(p.clone()));
        if !self.creator.is_empty() && !self.participants.contains(&self.creator) {
            self.participants.insert(0, self.creator.clone());
        }
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.creator == user_id || self.participants.iter().any(|p| p == user_id)
    }

    pub fn rehearses_on(&self, day: Weekday) -> bool {
        self.rehearsal_days.contains(&day)
    }
}

/// Fields supplied when a group is created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewGroup {
    pub title: String,
    pub description: String,
    pub location: String,
    pub rehearsal_days: Vec<Weekday>,
    pub presentation_date: Option<NaiveDate>,
    pub script: String,
    pub scenery: String,
    pub costumes: String,
    pub scene_count: u32,
    pub act_count: u32,
    pub actor_count: u32,
    pub costume_count: u32,
    pub creator: String,
    pub participants: Vec<String>,
}

impl NewGroup {
    pub fn new(title: &str, creator: &str) -> Self {
        Self {
            title: title.to_string(),
            creator: creator.to_string(),
            ..Default::default()
        }
    }

    pub fn with_rehearsal_days(mut self, days: &[&str]) -> Self {
        self.rehearsal_days = Weekday::normalize(days.iter().copied());
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_presentation_date(mut self, date: NaiveDate) -> Self {
        self.presentation_date = Some(date);
        self
    }

    /// Required-field checks run before any storage call.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title is required"));
        }
        if self.creator.trim().is_empty() {
            return Err(Error::validation("creator is required"));
        }
        Ok(())
    }

    /// Materializes the record under `id` (empty for a cloud insert).
    pub fn into_group(self, id: String, now: DateTime<Utc>) -> Group {
        let mut group = Group {
            id,
            title: self.title.trim().to_string(),
            description: self.description,
            location: self.location,
            rehearsal_days: self.rehearsal_days,
            presentation_date: self.presentation_date,
            script: self.script,
            scenery: self.scenery,
            costumes: self.costumes,
            scene_count: self.scene_count,
            act_count: self.act_count,
            actor_count: self.actor_count,
            costume_count: self.costume_count,
            creator: self.creator,
            participants: self.participants,
            alert: false,
            alert_message: String::new(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        group.ensure_creator_participant();
        group
    }
}

/// Partial update of a group; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPatch {
    #[serde(rename = "titulo", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "descricao", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "local", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "diasEnsaio", skip_serializing_if = "Option::is_none")]
    pub rehearsal_days: Option<Vec<Weekday>>,
    /// `Some(None)` clears the date.
    #[serde(
        rename = "dataApresentacao",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub presentation_date: Option<Option<NaiveDate>>,
    #[serde(rename = "roteiro", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(rename = "cenario", skip_serializing_if = "Option::is_none")]
    pub scenery: Option<String>,
    #[serde(rename = "figurino", skip_serializing_if = "Option::is_none")]
    pub costumes: Option<String>,
    #[serde(rename = "numeroCenas", skip_serializing_if = "Option::is_none")]
    pub scene_count: Option<u32>,
    #[serde(rename = "numeroAtos", skip_serializing_if = "Option::is_none")]
    pub act_count: Option<u32>,
    #[serde(rename = "numeroAtores", skip_serializing_if = "Option::is_none")]
    pub actor_count: Option<u32>,
    #[serde(rename = "numeroFigurinos", skip_serializing_if = "Option::is_none")]
    pub costume_count: Option<u32>,
    #[serde(rename = "participantes", skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
    #[serde(rename = "alerta", skip_serializing_if = "Option::is_none")]
    pub alert: Option<bool>,
    #[serde(rename = "mensagemAlerta", skip_serializing_if = "Option::is_none")]
    pub alert_message: Option<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// Keeps an explicit `null` apart from a missing field.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl GroupPatch {
    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn rehearsal_days(mut self, days: &[&str]) -> Self {
        self.rehearsal_days = Some(Weekday::normalize(days.iter().copied()));
        self
    }

    pub fn script(mut self, text: &str) -> Self {
        self.script = Some(text.to_string());
        self
    }

    pub fn scenery(mut self, text: &str) -> Self {
        self.scenery = Some(text.to_string());
        self
    }

    pub fn costumes(mut self, text: &str) -> Self {
        self.costumes = Some(text.to_string());
        self
    }

    /// Parses the `YYYY-MM-DD` form input; an empty string clears the date.
    pub fn presentation_date(mut self, raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            self.presentation_date = Some(None);
        } else {
            let date = parse_date(raw)
                .ok_or_else(|| Error::validation(format!("invalid presentation date: {}", raw)))?;
            self.presentation_date = Some(Some(date));
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        *self == GroupPatch::default()
    }

    /// Combines two patches; fields set in `later` win.
    pub fn merge(self, later: GroupPatch) -> GroupPatch {
        GroupPatch {
            title: later.title.or(self.title),
            description: later.description.or(self.description),
            location: later.location.or(self.location),
            rehearsal_days: later.rehearsal_days.or(self.rehearsal_days),
            presentation_date: later.presentation_date.or(self.presentation_date),
            script: later.script.or(self.script),
            scenery: later.scenery.or(self.scenery),
            costumes: later.costumes.or(self.costumes),
            scene_count: later.scene_count.or(self.scene_count),
            act_count: later.act_count.or(self.act_count),
            actor_count: later.actor_count.or(self.actor_count),
            costume_count: later.costume_count.or(self.costume_count),
            participants: later.participants.or(self.participants),
            alert: later.alert.or(self.alert),
            alert_message: later.alert_message.or(self.alert_message),
            updated_at: later.updated_at.or(self.updated_at),
        }
    }

    pub fn apply_to(&self, group: &mut Group) {
        if let Some(v) = &self.title {
            group.title = v.clone();
        }
        if let Some(v) = &self.description {
            group.description = v.clone();
        }
        if let Some(v) = &self.location {
            group.location = v.clone();
        }
        if let Some(v) = &self.rehearsal_days {
            group.rehearsal_days = v.clone();
        }
        if let Some(v) = self.presentation_date {
            group.presentation_date = v;
        }
        if let Some(v) = &self.script {
            group.script = v.clone();
        }
        if let Some(v) = &self.scenery {
            group.scenery = v.clone();
        }
        if let Some(v) = &self.costumes {
            group.costumes = v.clone();
        }
        if let Some(v) = self.scene_count {
            group.scene_count = v;
        }
        if let Some(v) = self.act_count {
            group.act_count = v;
        }
        if let Some(v) = self.actor_count {
            group.actor_count = v;
        }
        if let Some(v) = self.costume_count {
            group.costume_count = v;
        }
        if let Some(v) = &self.participants {
            group.participants = v.clone();
        }
        if let Some(v) = self.alert {
            group.alert = v;
        }
        if let Some(v) = &self.alert_message {
            group.alert_message = v.clone();
        }
        if let Some(v) = self.updated_at {
            group.updated_at = Some(v);
        }
        group.ensure_creator_participant();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weekday_parsing_is_lenient() {
        assert_eq!(Weekday::parse("Segunda"), Some(Weekday::Monday));
        assert_eq!(Weekday::parse("terca-feira"), Some(Weekday::Tuesday));
        assert_eq!(Weekday::parse(" SÁBADO "), Some(Weekday::Saturday));
        assert_eq!(Weekday::parse("Funday"), None);
        assert_eq!(
            Weekday::normalize(["Sexta", "Segunda", "sexta", "x"]),
            vec![Weekday::Monday, Weekday::Friday]
        );
    }

    #[test]
    fn from_document_defaults_missing_fields() {
        let group = Group::from_document(json!({ "id": "g1", "criador": "u1" })).unwrap();
        assert_eq!(group.id, "g1");
        assert_eq!(group.title, "");
        assert_eq!(group.scene_count, 0);
        assert!(group.rehearsal_days.is_empty());
        assert_eq!(group.participants, vec!["u1".to_string()]);
        assert!(!group.alert);
        assert!(group.created_at.is_none());
    }

    #[test]
    fn from_document_coerces_shapes() {
        let group = Group::from_document(json!({
            "id": "g2",
            "titulo": "Hamlet",
            "diasEnsaio": "Segunda, Quarta, Domingo",
            "numeroAtores": "12",
            "numeroCenas": 4.0,
            "participantes": ["u2", "u1", "u2", null],
            "criador": "u1",
            "alerta": "true",
            "dataApresentacao": "2024-11-20T00:00:00.000Z",
            "extraField": { "ignored": true }
        }))
        .unwrap();

        assert_eq!(
            group.rehearsal_days,
            vec![Weekday::Sunday, Weekday::Monday, Weekday::Wednesday]
        );
        assert_eq!(group.actor_count, 12);
        assert_eq!(group.scene_count, 4);
        assert_eq!(group.participants, vec!["u2".to_string(), "u1".to_string()]);
        assert!(group.alert);
        assert_eq!(
            group.presentation_date,
            NaiveDate::from_ymd_opt(2024, 11, 20)
        );
    }

    #[test]
    fn document_round_trip_keeps_portuguese_keys() {
        let group = NewGroup::new("Hamlet", "u1")
            .with_rehearsal_days(&["Segunda"])
            .into_group("g1".to_string(), Utc::now());
        let doc = serde_json::to_value(&group).unwrap();
        assert_eq!(doc["titulo"], "Hamlet");
        assert_eq!(doc["diasEnsaio"], json!(["Segunda"]));
        assert_eq!(doc["participantes"], json!(["u1"]));

        let back = Group::from_document(doc).unwrap();
        assert_eq!(back, group);
    }

    #[test]
    fn cloud_insert_document_has_no_id() {
        let group = NewGroup::new("Hamlet", "u1").into_group(String::new(), Utc::now());
        let doc = serde_json::to_value(&group).unwrap();
        assert!(doc.get("id").is_none());
    }

    #[test]
    fn new_group_validation() {
        assert!(NewGroup::new("  ", "u1").validate().is_err());
        assert!(NewGroup::new("Hamlet", "").validate().is_err());
        assert!(NewGroup::new("Hamlet", "u1").validate().is_ok());
    }

    #[test]
    fn patch_merge_prefers_later_fields() {
        let first = GroupPatch::default().title("A").location("Sala 1");
        let second = GroupPatch::default().title("B");
        let merged = first.merge(second);
        assert_eq!(merged.title.as_deref(), Some("B"));
        assert_eq!(merged.location.as_deref(), Some("Sala 1"));
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = GroupPatch::default().script("Ato I");
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "roteiro": "Ato I" }));
        assert!(GroupPatch::default().is_empty());
    }

    #[test]
    fn patch_cannot_drop_the_creator() {
        let mut group = NewGroup::new("Hamlet", "u1").into_group("g1".into(), Utc::now());
        let patch = GroupPatch {
            participants: Some(vec!["u2".to_string()]),
            ..Default::default()
        };
        patch.apply_to(&mut group);
        assert_eq!(group.participants, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn presentation_date_patch() {
        let patch = GroupPatch::default().presentation_date("2025-06-01").unwrap();
        assert_eq!(
            patch.presentation_date,
            Some(NaiveDate::from_ymd_opt(2025, 6, 1))
        );
        let cleared = GroupPatch::default().presentation_date("").unwrap();
        assert_eq!(cleared.presentation_date, Some(None));
        assert!(GroupPatch::default().presentation_date("01/06/2025").is_err());

        let decoded: GroupPatch =
            serde_json::from_value(json!({ "dataApresentacao": null })).unwrap();
        assert_eq!(decoded.presentation_date, Some(None));
        let untouched: GroupPatch = serde_json::from_value(json!({})).unwrap();
        assert_eq!(untouched.presentation_date, None);
    }
}
