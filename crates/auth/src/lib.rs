//! Authentication client for the ServeFirst backend
//!
//! Wraps the GoTrue endpoints (`/auth/v1/...`) of the Supabase-compatible
//! project: email/password and federated sign-in, password reset emails,
//! token refresh and the in-memory session.

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing session")]
    MissingSession,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

impl AuthError {
    /// The server was never reached.
    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::NetworkError(e) if e.status().is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub app_metadata: Value,
    #[serde(default)]
    pub user_metadata: Value,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl User {
    /// Looks up a string field in `user_metadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.user_metadata.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    /// Unix seconds; older servers omit it.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub token_type: String,
    pub user: User,
}

/// Result of a sign-up: projects with email confirmation enabled return only
/// the pending user.
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    Session(Session),
    ConfirmationRequired(User),
}

#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub persist_session: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            persist_session: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OAuthProvider {
    Google,
    Facebook,
    Apple,
    Github,
    Microsoft,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Facebook => "facebook",
            Self::Apple => "apple",
            Self::Github => "github",
            Self::Microsoft => "azure",
        }
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "facebook" => Ok(Self::Facebook),
            "apple" => Ok(Self::Apple),
            "github" => Ok(Self::Github),
            "microsoft" | "azure" => Ok(Self::Microsoft),
            other => Err(AuthError::AuthenticationError(format!(
                "unknown provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OAuthSignInOptions {
    pub redirect_to: Option<String>,
    pub scopes: Option<String>,
}

/// Auth client
pub struct Auth {
    url: String,
    key: String,
    http_client: Client,
    options: AuthOptions,
    current_session: Arc<RwLock<Option<Session>>>,
}

impl Auth {
    pub fn new(url: &str, key: &str, http_client: Client, options: AuthOptions) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
            options,
            current_session: Arc::new(RwLock::new(None)),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.current_session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.current_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store_session(&self, session: &Session) {
        if self.options.persist_session {
            *self.write_session() = Some(session.clone());
        }
    }

    async fn check(response: Response) -> Result<Response, AuthError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        log::debug!("auth request failed with {}: {}", status, error_text);
        Err(AuthError::ApiError(error_text))
    }

    /// Registers a new user; `metadata` lands in `user_metadata`.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<SignUpOutcome, AuthError> {
        let mut payload = serde_json::json!({
            "email": email,
            "password": password,
        });
        if let Some(data) = metadata {
            payload["data"] = data;
        }

        let response = self
            .http_client
            .post(self.endpoint("/signup"))
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let body: Value = Self::check(response).await?.json().await?;

        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)?;
            self.store_session(&session);
            Ok(SignUpOutcome::Session(session))
        } else {
            // Some servers wrap the pending user as {"user": {...}}.
            let user_value = body.get("user").cloned().unwrap_or(body);
            let user: User = serde_json::from_value(user_value)?;
            Ok(SignUpOutcome::ConfirmationRequired(user))
        }
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let response = self
            .http_client
            .post(self.endpoint("/token?grant_type=password"))
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let session: Session = Self::check(response).await?.json().await?;
        self.store_session(&session);
        Ok(session)
    }

    pub fn get_session(&self) -> Option<Session> {
        self.read_session().clone()
    }

    /// Installs a session restored from elsewhere (e.g. a local cache).
    pub fn set_session(&self, session: Option<Session>) {
        *self.write_session() = session;
    }

    /// Updates email, password or `data` (user metadata) of the signed-in user.
    pub async fn update_user(&self, attributes: Value) -> Result<User, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;

        let response = self
            .http_client
            .put(self.endpoint("/user"))
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .json(&attributes)
            .send()
            .await?;

        let user: User = Self::check(response).await?.json().await?;

        if let Some(current) = self.write_session().as_mut() {
            current.user = user.clone();
        }
        Ok(user)
    }

    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;

        let payload = serde_json::json!({
            "refresh_token": session.refresh_token,
        });

        let response = self
            .http_client
            .post(self.endpoint("/token?grant_type=refresh_token"))
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let new_session: Session = Self::check(response).await?.json().await?;
        self.store_session(&new_session);
        Ok(new_session)
    }

    /// Revokes the session server-side. The local session is dropped either way.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.write_session().take().ok_or(AuthError::MissingSession)?;

        let response = self
            .http_client
            .post(self.endpoint("/logout"))
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    pub async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> Result<(), AuthError> {
        let mut url = self.endpoint("/recover");
        if let Some(redirect) = redirect_to {
            url.push_str(&format!("?redirect_to={}", urlencoding::encode(redirect)));
        }

        let payload = serde_json::json!({
            "email": email,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    /// URL the user's browser must visit for federated sign-in.
    pub fn get_oauth_sign_in_url(
        &self,
        provider: OAuthProvider,
        options: Option<OAuthSignInOptions>,
    ) -> String {
        let options = options.unwrap_or_default();

        let mut url = format!("{}?provider={}", self.endpoint("/authorize"), provider.as_str());

        if let Some(redirect_to) = options.redirect_to {
            url.push_str(&format!(
                "&redirect_to={}",
                urlencoding::encode(&redirect_to)
            ));
        }

        if let Some(scopes) = options.scopes {
            url.push_str(&format!("&scopes={}", urlencoding::encode(&scopes)));
        }

        url
    }

    /// Completes the OAuth redirect by trading the callback code for a session.
    pub async fn exchange_code_for_session(&self, code: &str) -> Result<Session, AuthError> {
        let payload = serde_json::json!({
            "auth_code": code,
        });

        let response = self
            .http_client
            .post(self.endpoint("/token?grant_type=pkce"))
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let session: Session = Self::check(response).await?.json().await?;
        self.store_session(&session);
        Ok(session)
    }

    /// Cheap reachability check used by the connectivity monitor.
    pub async fn health(&self) -> Result<(), AuthError> {
        let response = self
            .http_client
            .get(self.endpoint("/health"))
            .header("apikey", &self.key)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_body() -> Value {
        serde_json::json!({
            "access_token": "test_access_token",
            "refresh_token": "test_refresh_token",
            "expires_in": 3600,
            "expires_at": 1700003600,
            "token_type": "bearer",
            "user": {
                "id": "test_user_id",
                "email": "test@example.com",
                "phone": null,
                "app_metadata": {},
                "user_metadata": { "nome": "Ana" },
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }
        })
    }

    #[test]
    fn test_sign_up_returns_session() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("POST"))
                .and(path("/auth/v1/signup"))
                .and(body_json(serde_json::json!({
                    "email": "test@example.com",
                    "password": "password123",
                    "data": { "nome": "Ana" }
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
                .mount(&mock_server)
                .await;

            let auth = Auth::new(
                &mock_server.uri(),
                "test_key",
                Client::new(),
                AuthOptions::default(),
            );

            let outcome = auth
                .sign_up(
                    "test@example.com",
                    "password123",
                    Some(serde_json::json!({ "nome": "Ana" })),
                )
                .await
                .unwrap();

            match outcome {
                SignUpOutcome::Session(session) => {
                    assert_eq!(session.access_token, "test_access_token");
                    assert_eq!(session.user.metadata_str("nome"), Some("Ana"));
                }
                other => panic!("expected session, got {:?}", other),
            }
            assert!(auth.get_session().is_some());
        });
    }

    #[tokio::test]
    async fn test_sign_up_requiring_confirmation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pending-user",
                "email": "new@example.com"
            })))
            .mount(&mock_server)
            .await;

        let auth = Auth::new(
            &mock_server.uri(),
            "test_key",
            Client::new(),
            AuthOptions::default(),
        );

        let outcome = auth.sign_up("new@example.com", "secret1", None).await.unwrap();
        match outcome {
            SignUpOutcome::ConfirmationRequired(user) => assert_eq!(user.id, "pending-user"),
            other => panic!("expected pending user, got {:?}", other),
        }
        assert!(auth.get_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_failure_keeps_no_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&mock_server)
            .await;

        let auth = Auth::new(
            &mock_server.uri(),
            "test_key",
            Client::new(),
            AuthOptions::default(),
        );

        let result = auth.sign_in_with_password("a@b.com", "wrong").await;
        assert!(matches!(result, Err(AuthError::ApiError(_))));
        assert!(auth.get_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_clears_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer test_access_token"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let auth = Auth::new(
            &mock_server.uri(),
            "test_key",
            Client::new(),
            AuthOptions::default(),
        );
        auth.set_session(Some(serde_json::from_value(session_body()).unwrap()));

        auth.sign_out().await.unwrap();
        assert!(auth.get_session().is_none());
        assert!(matches!(auth.sign_out().await, Err(AuthError::MissingSession)));
    }

    #[test]
    fn test_oauth_sign_in_url() {
        let auth = Auth::new(
            "https://example.supabase.co/",
            "test-key",
            Client::new(),
            AuthOptions::default(),
        );

        let url = auth.get_oauth_sign_in_url(OAuthProvider::Google, None);
        assert_eq!(
            url,
            "https://example.supabase.co/auth/v1/authorize?provider=google"
        );

        let options = OAuthSignInOptions {
            redirect_to: Some("https://example.com/callback".to_string()),
            scopes: Some("email profile".to_string()),
        };
        let url = auth.get_oauth_sign_in_url(OAuthProvider::Github, Some(options));
        assert!(url.contains("provider=github"));
        assert!(url.contains("redirect_to=https%3A%2F%2Fexample.com%2Fcallback"));
        assert!(url.contains("scopes=email%20profile"));
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("Google".parse::<OAuthProvider>().unwrap(), OAuthProvider::Google);
        assert_eq!("azure".parse::<OAuthProvider>().unwrap(), OAuthProvider::Microsoft);
        assert!("myspace".parse::<OAuthProvider>().is_err());
    }
}
