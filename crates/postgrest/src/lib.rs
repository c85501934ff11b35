//! Document collection client for the ServeFirst backend
//!
//! Talks to the PostgREST endpoint (`/rest/v1/{collection}`) of the
//! Supabase-compatible project that stores theater groups, events and
//! user profiles.
//!
//! # Features
//!
//! - Query API (`select`, `insert`, `update`, `delete`)
//! - Equality and array-membership filters (`eq`, `array_contains`)
//! - Range filters for calendar queries (`gte`, `lt`)
//! - Ordering and limits

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Error body returned by PostgREST
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum PostgrestError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: PostgrestApiErrorDetails,
        status: StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError { message: String, status: StatusCode },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl PostgrestError {
    /// HTTP status of the failed request, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PostgrestError::ApiError { status, .. } => Some(*status),
            PostgrestError::UnparsedApiError { status, .. } => Some(*status),
            PostgrestError::NetworkError(e) => e.status(),
            _ => None,
        }
    }

    /// The request never got an HTTP answer (DNS, refused connection, timeout).
    pub fn is_network(&self) -> bool {
        matches!(self, PostgrestError::NetworkError(e) if e.status().is_none())
    }

    /// Row level security or missing credentials rejected the request.
    pub fn is_permission_denied(&self) -> bool {
        if matches!(
            self.status(),
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN)
        ) {
            return true;
        }
        // insufficient_privilege
        matches!(
            self,
            PostgrestError::ApiError { details, .. } if details.code.as_deref() == Some("42501")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Query builder bound to one collection
#[derive(Clone)]
pub struct PostgrestClient {
    base_url: String,
    table: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: HashMap<String, String>,
}

impl PostgrestClient {
    pub fn new(base_url: &str, api_key: &str, table: &str, http_client: Client) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("apikey", value);
        }
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            http_client,
            headers,
            query_params: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, PostgrestError> {
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header value: {}", value))
        })?;

        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header name: {}", key))
        })?;

        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Sends the user's access token instead of the anon key as bearer.
    pub fn with_auth(self, token: &str) -> Result<Self, PostgrestError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.query_params
            .insert("select".to_string(), columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("eq.{}", value));
        self
    }

    pub fn gte(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("gte.{}", value));
        self
    }

    /// Range filter on a single column (`gte` and `lt` both apply).
    pub fn between(mut self, column: &str, from: &str, until: &str) -> Self {
        self.query_params.insert(
            "and".to_string(),
            format!("({}.gte.{},{}.lt.{})", column, from, column, until),
        );
        self
    }

    /// Array column contains every given element (`cs.{a,b}`).
    pub fn array_contains(mut self, column: &str, values: &[&str]) -> Self {
        let quoted: Vec<String> = values
            .iter()
            .map(|v| format!("\"{}\"", v.replace('"', "\\\"")))
            .collect();
        self.query_params
            .insert(column.to_string(), format!("cs.{{{}}}", quoted.join(",")));
        self
    }

    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        let order_str = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        self.query_params
            .insert("order".to_string(), format!("{}.{}", column, order_str));
        self
    }

    pub fn limit(mut self, count: i32) -> Self {
        self.query_params
            .insert("limit".to_string(), count.to_string());
        self
    }

    /// Fetches the matching rows.
    pub async fn execute<T: for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>, PostgrestError> {
        let url = self.build_url()?;
        log::debug!("GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(PostgrestError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// Fetches at most one row; `None` when nothing matches.
    pub async fn maybe_single<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, PostgrestError> {
        let mut rows = self.clone().limit(1).execute::<T>().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Inserts rows and returns the stored representation.
    pub async fn insert<T: Serialize>(&self, values: T) -> Result<Value, PostgrestError> {
        let url = self.build_url()?;
        log::debug!("POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .headers(self.representation_headers())
            .json(&values)
            .send()
            .await
            .map_err(PostgrestError::NetworkError)?;

        Self::read_body(response).await
    }

    /// Patches the rows selected by the current filters.
    pub async fn update<T: Serialize>(&self, values: T) -> Result<Value, PostgrestError> {
        self.require_filter("update")?;
        let url = self.build_url()?;
        log::debug!("PATCH {}", url);

        let response = self
            .http_client
            .patch(&url)
            .headers(self.representation_headers())
            .json(&values)
            .send()
            .await
            .map_err(PostgrestError::NetworkError)?;

        Self::read_body(response).await
    }

    /// Deletes the rows selected by the current filters.
    pub async fn delete(&self) -> Result<Value, PostgrestError> {
        self.require_filter("delete")?;
        let url = self.build_url()?;
        log::debug!("DELETE {}", url);

        let response = self
            .http_client
            .delete(&url)
            .headers(self.representation_headers())
            .send()
            .await
            .map_err(PostgrestError::NetworkError)?;

        Self::read_body(response).await
    }

    fn representation_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );
        headers
    }

    // A filterless PATCH/DELETE would touch the whole collection.
    fn require_filter(&self, operation: &str) -> Result<(), PostgrestError> {
        let has_filter = self
            .query_params
            .keys()
            .any(|k| !matches!(k.as_str(), "select" | "order" | "limit"));
        if has_filter {
            Ok(())
        } else {
            Err(PostgrestError::InvalidParameters(format!(
                "{} on '{}' requires a filter",
                operation, self.table
            )))
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<Value, PostgrestError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body_text = response.text().await.map_err(|e| {
            PostgrestError::DeserializationError(format!("Failed to read response body: {}", e))
        })?;

        // 204 No Content
        if body_text.trim().is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str::<Value>(&body_text)
                .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
        }
    }

    async fn error_from_response(response: reqwest::Response) -> PostgrestError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        match serde_json::from_str::<PostgrestApiErrorDetails>(&error_text) {
            Ok(details) => PostgrestError::ApiError { details, status },
            Err(_) => PostgrestError::UnparsedApiError {
                message: error_text,
                status,
            },
        }
    }

    fn build_url(&self) -> Result<String, PostgrestError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;

        let mut params: Vec<(&String, &String)> = self.query_params.iter().collect();
        params.sort();
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, table: &str) -> PostgrestClient {
        PostgrestClient::new(&server.uri(), "fake-key", table, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_select_with_eq_filter() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("select", "*"))
            .and(query_param("criador", "eq.user-1"))
            .and(header("apikey", "fake-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g1", "titulo": "Hamlet" },
                { "id": "g2", "titulo": "Macbeth" }
            ])))
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "teatros")
            .select("*")
            .eq("criador", "user-1")
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["titulo"], "Hamlet");
    }

    #[tokio::test]
    async fn test_array_contains_filter() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("participantes", "cs.{\"user-2\"}"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g3", "participantes": ["user-1", "user-2"] }
            ])))
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "teatros")
            .select("*")
            .array_contains("participantes", &["user-2"])
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "g3");
    }

    #[tokio::test]
    async fn test_maybe_single_empty() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("id", "eq.missing"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        let row = client(&mock_server, "teatros")
            .select("*")
            .eq("id", "missing")
            .maybe_single::<Value>()
            .await
            .unwrap();

        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_insert_returns_representation() {
        let mock_server = MockServer::start().await;
        let payload = json!({ "titulo": "Hamlet" });

        Mock::given(method("POST"))
            .and(path("/rest/v1/teatros"))
            .and(header("prefer", "return=representation"))
            .and(body_json(&payload))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!([{ "id": "cloud-1", "titulo": "Hamlet" }])),
            )
            .mount(&mock_server)
            .await;

        let value = client(&mock_server, "teatros")
            .insert(&payload)
            .await
            .unwrap();

        assert_eq!(value[0]["id"], "cloud-1");
    }

    #[tokio::test]
    async fn test_update_without_filter_is_rejected() {
        let mock_server = MockServer::start().await;

        let result = client(&mock_server, "teatros")
            .select("*")
            .update(json!({ "titulo": "x" }))
            .await;

        assert!(matches!(
            result,
            Err(PostgrestError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_no_content() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/teatros"))
            .and(query_param("id", "eq.g1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let value = client(&mock_server, "teatros")
            .eq("id", "g1")
            .delete()
            .await
            .unwrap();

        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_api_error_is_parsed_and_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/teatros"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "permission denied for table teatros",
                "details": null,
                "hint": null
            })))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server, "teatros")
            .select("*")
            .execute::<Value>()
            .await
            .unwrap_err();

        assert!(err.is_permission_denied());
        assert!(!err.is_network());
        match err {
            PostgrestError::ApiError { details, status } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(details.code.as_deref(), Some("42501"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparsed_error_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/eventos"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server, "eventos")
            .select("*")
            .execute::<Value>()
            .await
            .unwrap_err();

        match err {
            PostgrestError::UnparsedApiError { message, status } => {
                assert_eq!(message, "boom");
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
