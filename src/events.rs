//! Calendar of events
//!
//! Everyone can read; only admins create, edit or delete. Reads fall back
//! to the `eventos_offline` mirror when the cloud cannot be reached.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use servefirst_auth::Auth;
use servefirst_postgrest::{PostgrestClient, SortOrder};

use crate::error::{Error, Result};
use crate::local::{read_json, write_json, LocalStore};
use crate::models::{Event, EventPatch, NewEvent, UserProfile};

pub const EVENTS_MIRROR_KEY: &str = "eventos_offline";

const COLLECTION: &str = "eventos";

/// Cloud side of the `eventos` collection.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn all(&self) -> Result<Vec<Event>>;

    /// Events dated in `[from, until)`.
    async fn in_range(&self, from: NaiveDate, until: NaiveDate) -> Result<Vec<Event>>;

    async fn from_date(&self, from: NaiveDate, limit: usize) -> Result<Vec<Event>>;

    async fn for_group(&self, group_id: &str) -> Result<Vec<Event>>;

    async fn fetch(&self, id: &str) -> Result<Option<Event>>;

    async fn insert(&self, event: &Event) -> Result<Event>;

    async fn update(&self, id: &str, patch: &EventPatch) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct PostgrestEventStore {
    url: String,
    key: String,
    http_client: Client,
    auth: Option<Arc<Auth>>,
}

impl PostgrestEventStore {
    pub fn new(url: &str, key: &str, http_client: Client) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            http_client,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    fn query(&self) -> Result<PostgrestClient> {
        let client = PostgrestClient::new(&self.url, &self.key, COLLECTION, self.http_client.clone());
        match self.auth.as_ref().and_then(|auth| auth.get_session()) {
            Some(session) => Ok(client.with_auth(&session.access_token)?),
            None => Ok(client),
        }
    }

    async fn run(query: PostgrestClient) -> Result<Vec<Event>> {
        let rows = query
            .order("data", SortOrder::Ascending)
            .execute::<Value>()
            .await?;
        Ok(decode(rows))
    }
}

fn decode(rows: Vec<Value>) -> Vec<Event> {
    rows.into_iter()
        .filter_map(|row| match Event::from_document(row) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("skipping malformed {} document: {}", COLLECTION, e);
                None
            }
        })
        .collect()
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl EventStore for PostgrestEventStore {
    async fn all(&self) -> Result<Vec<Event>> {
        Self::run(self.query()?).await
    }

    async fn in_range(&self, from: NaiveDate, until: NaiveDate) -> Result<Vec<Event>> {
        Self::run(self.query()?.between("data", &iso(from), &iso(until))).await
    }

    async fn from_date(&self, from: NaiveDate, limit: usize) -> Result<Vec<Event>> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        Self::run(self.query()?.gte("data", &iso(from)).limit(limit)).await
    }

    async fn for_group(&self, group_id: &str) -> Result<Vec<Event>> {
        Self::run(self.query()?.eq("teatroId", group_id)).await
    }

    async fn fetch(&self, id: &str) -> Result<Option<Event>> {
        match self.query()?.eq("id", id).maybe_single::<Value>().await? {
            Some(row) => Ok(Some(Event::from_document(row)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, event: &Event) -> Result<Event> {
        let mut document = event.clone();
        document.id.clear();
        let row = match self.query()?.insert(&document).await? {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            other @ Value::Object(_) => other,
            _ => return Err(Error::not_found("insert returned no representation")),
        };
        Event::from_document(row)
    }

    async fn update(&self, id: &str, patch: &EventPatch) -> Result<()> {
        self.query()?.eq("id", id).update(patch).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.query()?.eq("id", id).delete().await?;
        Ok(())
    }
}

fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| (a.date, a.starts_at()).cmp(&(b.date, b.starts_at())));
}

fn month_range(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    let from = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::validation(format!("invalid month: {}-{}", year, month)))?;
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let until = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .ok_or_else(|| Error::validation(format!("invalid month: {}-{}", year, month)))?;
    Ok((from, until))
}

fn require_admin(actor: &UserProfile) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(Error::permission_denied("only admins manage events"))
    }
}

pub struct EventService {
    store: Arc<dyn EventStore>,
    local: Arc<dyn LocalStore>,
}

impl EventService {
    pub fn new(store: Arc<dyn EventStore>, local: Arc<dyn LocalStore>) -> Self {
        Self { store, local }
    }

    async fn mirror(&self) -> Result<Vec<Event>> {
        match read_json::<Vec<Value>>(self.local.as_ref(), EVENTS_MIRROR_KEY).await {
            Ok(Some(rows)) => {
                let mut events = decode(rows);
                sort_events(&mut events);
                Ok(events)
            }
            Ok(None) => Ok(Vec::new()),
            Err(Error::LocalStore(msg)) => {
                warn!("ignoring unreadable event mirror: {}", msg);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn save_mirror(&self, events: &[Event]) -> Result<()> {
        write_json(self.local.as_ref(), EVENTS_MIRROR_KEY, events).await
    }

    /// Cloud result, or the mirror filtered by `keep` when the cloud fails.
    async fn or_mirror<F>(&self, what: &str, cloud: Result<Vec<Event>>, keep: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        match cloud {
            Ok(mut events) => {
                sort_events(&mut events);
                Ok(events)
            }
            Err(e) => {
                warn!("{} failed, using the event mirror: {}", what, e);
                Ok(self.mirror().await?.into_iter().filter(|e| keep(e)).collect())
            }
        }
    }

    /// All events by date; refreshes the mirror.
    pub async fn list(&self) -> Result<Vec<Event>> {
        match self.store.all().await {
            Ok(mut events) => {
                sort_events(&mut events);
                self.save_mirror(&events).await?;
                debug!(count = events.len(), "event mirror refreshed");
                Ok(events)
            }
            Err(e) => {
                warn!("listing events failed, using the event mirror: {}", e);
                self.mirror().await
            }
        }
    }

    pub async fn in_month(&self, year: i32, month: u32) -> Result<Vec<Event>> {
        let (from, until) = month_range(year, month)?;
        let cloud = self.store.in_range(from, until).await;
        self.or_mirror("monthly calendar", cloud, |e| {
            e.date.map(|d| d >= from && d < until).unwrap_or(false)
        })
        .await
    }

    pub async fn on_day(&self, day: NaiveDate) -> Result<Vec<Event>> {
        let until = day
            .succ_opt()
            .ok_or_else(|| Error::validation(format!("invalid day: {}", day)))?;
        let cloud = self.store.in_range(day, until).await;
        self.or_mirror("daily calendar", cloud, |e| e.is_on(day)).await
    }

    pub async fn for_group(&self, group_id: &str) -> Result<Vec<Event>> {
        let cloud = self.store.for_group(group_id).await;
        self.or_mirror("group events", cloud, |e| {
            e.group_id.as_deref() == Some(group_id)
        })
        .await
    }

    /// At most `limit` events dated `from` or later.
    pub async fn upcoming(&self, from: NaiveDate, limit: usize) -> Result<Vec<Event>> {
        let cloud = self.store.from_date(from, limit).await;
        let mut events = self
            .or_mirror("upcoming events", cloud, |e| {
                e.date.map(|d| d >= from).unwrap_or(false)
            })
            .await?;
        events.truncate(limit);
        Ok(events)
    }

    /// Days of the month that have at least one event.
    pub async fn busy_days(&self, year: i32, month: u32) -> Result<Vec<u32>> {
        let mut days: Vec<u32> = self
            .in_month(year, month)
            .await?
            .iter()
            .filter_map(|e| e.date.map(|d| d.day()))
            .collect();
        days.dedup();
        Ok(days)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Event>> {
        match self.store.fetch(id).await {
            Ok(event) => Ok(event),
            Err(e) => {
                warn!("fetching event failed, using the event mirror: {}", e);
                Ok(self.mirror().await?.into_iter().find(|ev| ev.id == id))
            }
        }
    }

    pub async fn create(&self, actor: &UserProfile, event: NewEvent) -> Result<Event> {
        require_admin(actor)?;
        event.validate()?;

        let mut draft = event.into_event(Utc::now());
        if draft.organizer.trim().is_empty() {
            draft.organizer = actor.name.clone();
        }
        let created = self.store.insert(&draft).await?;

        let mut events = self.mirror().await?;
        events.push(created.clone());
        sort_events(&mut events);
        self.save_mirror(&events).await?;
        Ok(created)
    }

    pub async fn update(&self, actor: &UserProfile, id: &str, mut patch: EventPatch) -> Result<()> {
        require_admin(actor)?;
        patch.validate()?;
        if patch.start_time.is_some() != patch.end_time.is_some() {
            // One side changes: check it against the stored other side.
            if let Some(mut merged) = self.get(id).await? {
                patch.apply_to(&mut merged);
                EventPatch {
                    start_time: merged.start_time,
                    end_time: merged.end_time,
                    ..Default::default()
                }
                .validate()?;
            }
        }
        patch.updated_at = Some(Utc::now());
        self.store.update(id, &patch).await?;

        let mut events = self.mirror().await?;
        if let Some(event) = events.iter_mut().find(|e| e.id == id) {
            patch.apply_to(event);
            sort_events(&mut events);
            self.save_mirror(&events).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, actor: &UserProfile, id: &str) -> Result<()> {
        require_admin(actor)?;
        self.store.delete(id).await?;

        let mut events = self.mirror().await?;
        let before = events.len();
        events.retain(|e| e.id != id);
        if events.len() != before {
            self.save_mirror(&events).await?;
        }
        Ok(())
    }
}
