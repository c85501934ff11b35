use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use servefirst_auth::Auth;
use servefirst_postgrest::{PostgrestClient, SortOrder};

use super::{cloud_listing, GroupRepository, GroupStore, SyncReport, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Group, GroupPatch, NewGroup};

const COLLECTION: &str = "teatros";

/// `teatros` collection over PostgREST.
///
/// Requests carry the signed-in user's access token when an [`Auth`] is
/// attached, so row level security sees the user.
#[derive(Clone)]
pub struct PostgrestGroupStore {
    url: String,
    key: String,
    http_client: Client,
    auth: Option<Arc<Auth>>,
}

impl PostgrestGroupStore {
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

    fn decode(rows: Vec<Value>) -> Vec<Group> {
        rows.into_iter()
            .filter_map(|row| match Group::from_document(row) {
                Ok(group) => Some(group),
                Err(e) => {
                    warn!("skipping malformed {} document: {}", COLLECTION, e);
                    None
                }
            })
            .collect()
    }

    fn first_row(body: Value) -> Result<Group> {
        let row = match body {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            Value::Object(_) => body,
            _ => return Err(Error::not_found("insert returned no representation")),
        };
        Group::from_document(row)
    }
}

#[async_trait]
impl GroupStore for PostgrestGroupStore {
    async fn by_creator(&self, user_id: &str) -> Result<Vec<Group>> {
        let rows = self
            .query()?
            .eq("criador", user_id)
            .order("createdAt", SortOrder::Descending)
            .execute::<Value>()
            .await?;
        Ok(Self::decode(rows))
    }

    async fn by_participant(&self, user_id: &str) -> Result<Vec<Group>> {
        let rows = self
            .query()?
            .array_contains("participantes", &[user_id])
            .order("createdAt", SortOrder::Descending)
            .execute::<Value>()
            .await?;
        Ok(Self::decode(rows))
    }

    async fn fetch(&self, id: &str) -> Result<Option<Group>> {
        match self.query()?.eq("id", id).maybe_single::<Value>().await? {
            Some(row) => Ok(Some(Group::from_document(row)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, group: &Group) -> Result<Group> {
        let mut document = group.clone();
        document.id.clear();
        let body = self.query()?.insert(&document).await?;
        Self::first_row(body)
    }

    async fn update(&self, id: &str, patch: &GroupPatch) -> Result<()> {
        self.query()?.eq("id", id).update(patch).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.query()?.eq("id", id).delete().await?;
        Ok(())
    }
}

/// Cloud-only strategy: every call goes to the store and errors reach the
/// caller. There is never anything to sync.
pub struct CloudGroupRepository<S> {
    store: S,
}

impl<S: GroupStore> CloudGroupRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: GroupStore> GroupRepository for CloudGroupRepository<S> {
    async fn list(&self, user_id: &str) -> Result<Vec<Group>> {
        cloud_listing(&self.store, user_id).await
    }

    async fn get(&self, id: &str) -> Result<Option<Group>> {
        self.store.fetch(id).await
    }

    async fn create(&self, group: NewGroup) -> Result<Group> {
        group.validate()?;
        let group = group.into_group(String::new(), Utc::now());
        self.store.insert(&group).await
    }

    async fn update(&self, id: &str, mut patch: GroupPatch) -> Result<WriteOutcome> {
        patch.updated_at = Some(Utc::now());
        self.store.update(id, &patch).await?;
        Ok(WriteOutcome::Synced)
    }

    async fn delete(&self, id: &str) -> Result<WriteOutcome> {
        self.store.delete(id).await?;
        Ok(WriteOutcome::Synced)
    }

    async fn sync(&self, _user_id: &str) -> Result<SyncReport> {
        Ok(SyncReport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> PostgrestGroupStore {
        PostgrestGroupStore::new(&server.uri(), "anon-key", Client::new())
    }

    #[tokio::test]
    async fn listing_queries_creator_and_participant() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("criador", "eq.u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g1", "titulo": "Hamlet", "criador": "u1" }
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("participantes", "cs.{\"u1\"}"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g1", "titulo": "Hamlet", "criador": "u1" },
                { "id": "g2", "titulo": "Macbeth", "criador": "u2", "participantes": ["u2", "u1"] },
                { "titulo": "broken, no id" }
            ])))
            .mount(&server)
            .await;

        let repo = CloudGroupRepository::new(store(&server));
        let groups = repo.list("u1").await.unwrap();
        let ids: Vec<&str> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn insert_sends_document_without_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/teatros"))
            .and(header("apikey", "anon-key"))
            .and(body_partial_json(json!({
                "titulo": "Hamlet",
                "diasEnsaio": ["Segunda"],
                "participantes": ["u1"]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "cloud-1", "titulo": "Hamlet", "criador": "u1", "diasEnsaio": ["Segunda"] }
            ])))
            .mount(&server)
            .await;

        let repo = CloudGroupRepository::new(store(&server));
        let created = repo
            .create(NewGroup::new("Hamlet", "u1").with_rehearsal_days(&["Segunda"]))
            .await
            .unwrap();
        assert_eq!(created.id, "cloud-1");
        assert_eq!(created.participants, vec!["u1".to_string()]);

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(sent.get("id").is_none());
    }

    #[tokio::test]
    async fn errors_reach_the_caller() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("id", "eq.g1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "permission denied for table teatros"
            })))
            .mount(&server)
            .await;

        let repo = CloudGroupRepository::new(store(&server));
        let err = repo
            .update("g1", GroupPatch::default().title("x"))
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn fetch_missing_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("id", "eq.nope"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let repo = CloudGroupRepository::new(store(&server));
        assert!(repo.get("nope").await.unwrap().is_none());
    }
}
