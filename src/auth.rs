//! Signed-in user, profile and role
//!
//! [`AuthProvider`] pairs the auth client with the `usuarios` profile
//! collection. The session is kept in the local store so a restart can
//! resume it, and the profile is cached so the role is known offline.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use servefirst_auth::{Auth, OAuthProvider, OAuthSignInOptions, Session, SignUpOutcome, User};
use servefirst_postgrest::{PostgrestClient, SortOrder};
use servefirst_storage::{FileOptions, StorageClient};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::local::{read_json, write_json, LocalStore};
use crate::models::{Role, UserProfile, UserProfilePatch};

pub const SESSION_KEY: &str = "auth_session";

const PROFILES: &str = "usuarios";
const MIN_PASSWORD_LEN: usize = 6;

fn profile_key(user_id: &str) -> String {
    format!("usuario_{}", user_id)
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(Error::validation("email is required"));
    }
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid email: {}", email)))
    }
}

/// Registration form input
#[derive(Debug, Clone, Default)]
pub struct RegisterForm {
    pub name: String,
    pub email: String,
    pub password: String,
    /// Checked against `password` when present.
    pub confirm_password: Option<String>,
}

impl RegisterForm {
    pub fn new(name: &str, email: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            confirm_password: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name is required"));
        }
        validate_email(&self.email)?;
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::validation(format!(
                "password must have at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if let Some(confirm) = &self.confirm_password {
            if confirm != &self.password {
                return Err(Error::validation("passwords do not match"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Registration {
    SignedIn(UserProfile),
    /// The project requires email confirmation before the first login.
    ConfirmationRequired { email: String },
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// True when the access token's `exp` lies in the past. Tokens that cannot
/// be read count as expired. The signature is not checked; the server
/// does that on every request.
pub(crate) fn token_expired(token: &str, now: i64) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data.claims.exp.map(|exp| exp <= now).unwrap_or(false),
        Err(e) => {
            debug!("unreadable access token: {}", e);
            true
        }
    }
}

pub struct AuthProvider {
    auth: Arc<Auth>,
    local: Arc<dyn LocalStore>,
    url: String,
    key: String,
    http_client: Client,
    profile_bucket: String,
    persist_session: bool,
    current: RwLock<Option<UserProfile>>,
}

impl AuthProvider {
    pub fn new(
        config: &AppConfig,
        http_client: Client,
        auth: Arc<Auth>,
        local: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            auth,
            local,
            url: config.base_url().to_string(),
            key: config.anon_key.clone(),
            http_client,
            profile_bucket: config.options.profile_bucket.clone(),
            persist_session: config.options.persist_session,
            current: RwLock::new(None),
        }
    }

    pub fn auth(&self) -> &Arc<Auth> {
        &self.auth
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.current_user().map(|p| p.id)
    }

    /// `User` when nobody is signed in.
    pub fn role(&self) -> Role {
        self.current_user().map(|p| p.role).unwrap_or_default()
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Role::Admin
    }

    /// The signed-in profile, or `PermissionDenied`.
    pub fn require_user(&self) -> Result<UserProfile> {
        self.current_user()
            .ok_or_else(|| Error::permission_denied("sign in required"))
    }

    fn require_admin(&self) -> Result<UserProfile> {
        let user = self.require_user()?;
        if user.is_admin() {
            Ok(user)
        } else {
            Err(Error::permission_denied("admin role required"))
        }
    }

    fn set_current(&self, profile: Option<UserProfile>) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = profile;
    }

    fn profiles(&self) -> Result<PostgrestClient> {
        let client = PostgrestClient::new(&self.url, &self.key, PROFILES, self.http_client.clone());
        match self.auth.get_session() {
            Some(session) => Ok(client.with_auth(&session.access_token)?),
            None => Ok(client),
        }
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        if self.persist_session {
            write_json(self.local.as_ref(), SESSION_KEY, session).await?;
        }
        Ok(())
    }

    async fn remember(&self, profile: UserProfile) -> Result<UserProfile> {
        write_json(self.local.as_ref(), &profile_key(&profile.id), &profile).await?;
        self.set_current(Some(profile.clone()));
        Ok(profile)
    }

    fn display_name(user: &User) -> String {
        ["nome", "full_name", "name"]
            .iter()
            .find_map(|key| user.metadata_str(key))
            .map(str::to_string)
            .or_else(|| {
                user.email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    async fn create_profile(&self, user: &User) -> Result<UserProfile> {
        let document = json!({
            "id": user.id,
            "nome": Self::display_name(user),
            "email": user.email.clone().unwrap_or_default(),
            "role": Role::User,
            "createdAt": Utc::now().to_rfc3339(),
        });
        let body = self.profiles()?.insert(&document).await?;
        let row = match body {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            _ => document,
        };
        info!(user_id = %user.id, "created user profile");
        UserProfile::from_document(row)
    }

    /// Fetches the profile of `user`, creating it on first sign-in. When the
    /// cloud is unreachable the cached copy is used.
    async fn load_profile(&self, user: &User) -> Result<UserProfile> {
        let fetched = self
            .profiles()?
            .eq("id", &user.id)
            .maybe_single::<Value>()
            .await;

        let profile = match fetched {
            Ok(Some(document)) => UserProfile::from_document(document)?,
            Ok(None) => self.create_profile(user).await?,
            Err(e) if e.is_network() => {
                warn!("profile fetch failed, using cached profile: {}", e);
                match read_json::<UserProfile>(self.local.as_ref(), &profile_key(&user.id)).await? {
                    Some(cached) => cached,
                    None => UserProfile {
                        id: user.id.clone(),
                        name: Self::display_name(user),
                        email: user.email.clone().unwrap_or_default(),
                        ..Default::default()
                    },
                }
            }
            Err(e) => return Err(e.into()),
        };
        self.remember(profile).await
    }

    async fn start(&self, session: Session) -> Result<UserProfile> {
        self.persist(&session).await?;
        let profile = self.load_profile(&session.user).await?;
        info!(user_id = %profile.id, role = %profile.role, "signed in");
        Ok(profile)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile> {
        validate_email(email)?;
        if password.is_empty() {
            return Err(Error::validation("password is required"));
        }
        let session = self
            .auth
            .sign_in_with_password(email.trim(), password)
            .await?;
        self.start(session).await
    }

    pub async fn register(&self, form: RegisterForm) -> Result<Registration> {
        form.validate()?;
        let metadata = json!({ "nome": form.name.trim() });
        match self
            .auth
            .sign_up(form.email.trim(), &form.password, Some(metadata))
            .await?
        {
            SignUpOutcome::Session(session) => {
                Ok(Registration::SignedIn(self.start(session).await?))
            }
            SignUpOutcome::ConfirmationRequired(user) => {
                info!(user_id = %user.id, "registration awaits email confirmation");
                Ok(Registration::ConfirmationRequired {
                    email: form.email.trim().to_string(),
                })
            }
        }
    }

    /// Drops the local session; a failed server-side revoke is only logged.
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.auth.sign_out().await {
            warn!("sign out was not confirmed by the server: {}", e);
        }
        self.local.remove(SESSION_KEY).await?;
        self.set_current(None);
        Ok(())
    }

    pub async fn reset_password(&self, email: &str) -> Result<()> {
        validate_email(email)?;
        self.auth.reset_password_for_email(email.trim(), None).await?;
        Ok(())
    }

    pub fn oauth_url(&self, provider: OAuthProvider, redirect_to: Option<&str>) -> String {
        self.auth.get_oauth_sign_in_url(
            provider,
            Some(OAuthSignInOptions {
                redirect_to: redirect_to.map(str::to_string),
                scopes: None,
            }),
        )
    }

    /// Finishes a federated sign-in with the code from the redirect.
    pub async fn complete_oauth(&self, code: &str) -> Result<UserProfile> {
        if code.trim().is_empty() {
            return Err(Error::validation("authorization code is required"));
        }
        let session = self.auth.exchange_code_for_session(code.trim()).await?;
        self.start(session).await
    }

    /// Resumes the stored session, refreshing it when the access token has
    /// expired. Offline, an expired session is kept and the cached profile
    /// is used so local data stays reachable.
    pub async fn restore_session(&self) -> Result<Option<UserProfile>> {
        let stored = match read_json::<Session>(self.local.as_ref(), SESSION_KEY).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("discarding unreadable stored session: {}", e);
                self.local.remove(SESSION_KEY).await?;
                return Ok(None);
            }
        };
        self.auth.set_session(Some(stored.clone()));

        let session = if token_expired(&stored.access_token, Utc::now().timestamp()) {
            debug!("stored access token expired, refreshing");
            match self.auth.refresh_session().await {
                Ok(fresh) => {
                    self.persist(&fresh).await?;
                    fresh
                }
                Err(e) if e.is_network() => {
                    warn!("offline, keeping the expired session: {}", e);
                    stored
                }
                Err(e) => {
                    warn!("stored session rejected: {}", e);
                    self.auth.set_session(None);
                    self.local.remove(SESSION_KEY).await?;
                    return Ok(None);
                }
            }
        } else {
            stored
        };

        self.load_profile(&session.user).await.map(Some)
    }

    pub async fn update_profile(&self, patch: UserProfilePatch) -> Result<UserProfile> {
        let mut profile = self.require_user()?;
        if matches!(&patch.name, Some(name) if name.trim().is_empty()) {
            return Err(Error::validation("name is required"));
        }
        if patch == UserProfilePatch::default() {
            return Ok(profile);
        }

        self.profiles()?.eq("id", &profile.id).update(&patch).await?;
        patch.apply_to(&mut profile);
        self.remember(profile).await
    }

    /// Uploads a profile picture to the public bucket and stores its URL in
    /// the profile.
    pub async fn upload_profile_image(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<UserProfile> {
        let profile = self.require_user()?;
        let session = self.auth.get_session().ok_or_else(|| {
            Error::permission_denied("sign in required")
        })?;
        if bytes.is_empty() {
            return Err(Error::validation("image is empty"));
        }

        let safe_name: String = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let object_path = format!(
            "{}/{}_{}",
            profile.id,
            Utc::now().timestamp_millis(),
            safe_name
        );

        let storage = StorageClient::new(&self.url, &self.key, self.http_client.clone())
            .with_auth(&session.access_token);
        let bucket = storage.from(&self.profile_bucket);
        bucket
            .upload_bytes(
                &object_path,
                bytes,
                Some(
                    FileOptions::new()
                        .with_content_type(content_type)
                        .with_cache_control("3600")
                        .with_upsert(true),
                ),
            )
            .await?;
        let url = bucket.get_public_url(&object_path);

        let updated = self
            .update_profile(UserProfilePatch {
                photo_url: Some(url),
                ..Default::default()
            })
            .await?;

        // The previous picture is left behind if removing it fails.
        let bucket_prefix = bucket.get_public_url("");
        if let Some(old_path) = profile
            .photo_url
            .as_deref()
            .and_then(|old| old.strip_prefix(&bucket_prefix))
        {
            if let Err(e) = bucket.remove(vec![old_path]).await {
                warn!("could not remove previous profile image {}: {}", old_path, e);
            }
        }
        Ok(updated)
    }

    /// All profiles, by name. Admins only.
    pub async fn list_users(&self) -> Result<Vec<UserProfile>> {
        self.require_admin()?;
        let rows = self
            .profiles()?
            .order("nome", SortOrder::Ascending)
            .execute::<Value>()
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match UserProfile::from_document(row) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!("skipping malformed profile: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Admins only.
    pub async fn set_role(&self, user_id: &str, role: Role) -> Result<()> {
        let admin = self.require_admin()?;
        if admin.id == user_id && role != Role::Admin {
            return Err(Error::validation("admins cannot remove their own admin role"));
        }
        self.profiles()?
            .eq("id", user_id)
            .update(json!({ "role": role }))
            .await?;
        info!(user_id, role = %role, "role changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryStore;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use servefirst_auth::AuthOptions;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token(exp: i64) -> String {
        encode(
            &Header::default(),
            &json!({ "sub": "u1", "exp": exp }),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn session_body(access_token: &str) -> Value {
        json!({
            "access_token": access_token,
            "refresh_token": "refresh-1",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": {
                "id": "u1",
                "email": "ana@example.com",
                "user_metadata": { "nome": "Ana" }
            }
        })
    }

    fn provider(server: &MockServer, local: MemoryStore) -> AuthProvider {
        let config = AppConfig::new(&server.uri(), "anon-key").unwrap();
        let http = Client::new();
        let auth = Arc::new(Auth::new(
            config.base_url(),
            &config.anon_key,
            http.clone(),
            AuthOptions::default(),
        ));
        AuthProvider::new(&config, http, auth, Arc::new(local))
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("ana@example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("ana").is_err());
        assert!(validate_email("ana@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a@b@c.com").is_err());
    }

    #[test]
    fn register_form_validation() {
        assert!(RegisterForm::new("Ana", "ana@example.com", "segredo").validate().is_ok());
        assert!(RegisterForm::new("", "ana@example.com", "segredo").validate().is_err());
        assert!(RegisterForm::new("Ana", "ana@example.com", "12345").validate().is_err());
        let mut form = RegisterForm::new("Ana", "ana@example.com", "segredo");
        form.confirm_password = Some("outro".into());
        assert!(form.validate().is_err());
    }

    #[test]
    fn expiry_from_jwt() {
        let now = Utc::now().timestamp();
        assert!(token_expired(&token(now - 10), now));
        assert!(!token_expired(&token(now + 3600), now));
        assert!(token_expired("not-a-jwt", now));
    }

    #[tokio::test]
    async fn login_creates_missing_profile() {
        let server = MockServer::start().await;
        let local = MemoryStore::new();

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body("at-1")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/usuarios"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/usuarios"))
            .and(body_partial_json(json!({ "id": "u1", "nome": "Ana", "role": "user" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "u1", "nome": "Ana", "email": "ana@example.com", "role": "user" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server, local.clone());
        let profile = provider.login("ana@example.com", "segredo").await.unwrap();

        assert_eq!(profile.name, "Ana");
        assert_eq!(provider.role(), Role::User);
        assert!(local.get(SESSION_KEY).await.unwrap().is_some());
        assert!(local.get("usuario_u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn validation_runs_before_any_request() {
        let server = MockServer::start().await;
        let provider = provider(&server, MemoryStore::new());

        assert!(matches!(
            provider.login("nope", "segredo").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            provider
                .register(RegisterForm::new("Ana", "ana@example.com", "123"))
                .await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            provider.reset_password("").await,
            Err(Error::Validation(_))
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_refreshes_expired_session() {
        let server = MockServer::start().await;
        let local = MemoryStore::new();
        let expired = token(Utc::now().timestamp() - 60);
        let fresh = token(Utc::now().timestamp() + 3600);
        write_json(&local, SESSION_KEY, &session_body(&expired)).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body(&fresh)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/usuarios"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "u1", "nome": "Ana", "role": "admin" }
            ])))
            .mount(&server)
            .await;

        let provider = provider(&server, local.clone());
        let profile = provider.restore_session().await.unwrap().unwrap();
        assert!(profile.is_admin());
        assert!(provider.is_admin());

        let stored: Session = read_json(&local, SESSION_KEY).await.unwrap().unwrap();
        assert_eq!(stored.access_token, fresh);
    }

    #[tokio::test]
    async fn rejected_refresh_signs_out() {
        let server = MockServer::start().await;
        let local = MemoryStore::new();
        let expired = token(Utc::now().timestamp() - 60);
        write_json(&local, SESSION_KEY, &session_body(&expired)).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid refresh token"))
            .mount(&server)
            .await;

        let provider = provider(&server, local.clone());
        assert!(provider.restore_session().await.unwrap().is_none());
        assert!(local.get(SESSION_KEY).await.unwrap().is_none());
        assert!(provider.current_user().is_none());
    }

    #[tokio::test]
    async fn admin_tools_require_admin() {
        let server = MockServer::start().await;
        let provider = provider(&server, MemoryStore::new());

        assert!(provider.list_users().await.unwrap_err().is_permission_denied());

        provider.set_current(Some(UserProfile {
            id: "u1".into(),
            role: Role::User,
            ..Default::default()
        }));
        assert!(provider
            .set_role("u2", Role::Admin)
            .await
            .unwrap_err()
            .is_permission_denied());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_sets_role() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/usuarios"))
            .and(query_param("id", "eq.u2"))
            .and(body_partial_json(json!({ "role": "admin" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server, MemoryStore::new());
        provider.set_current(Some(UserProfile {
            id: "u1".into(),
            role: Role::Admin,
            ..Default::default()
        }));
        provider.set_role("u2", Role::Admin).await.unwrap();
        assert!(provider.set_role("u1", Role::User).await.is_err());
    }

    #[tokio::test]
    async fn profile_image_replaces_previous_one() {
        let server = MockServer::start().await;
        let local = MemoryStore::new();

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body("at-1")))
            .mount(&server)
            .await;
        let old_photo = format!(
            "{}/storage/v1/object/public/profile-images/u1/old.png",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/rest/v1/usuarios"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "u1", "nome": "Ana", "role": "user", "fotoUrl": old_photo }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/profile-images"))
            .and(body_partial_json(json!({ "prefixes": ["u1/old.png"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::path_regex(r"^/storage/v1/object/profile-images/u1/.+_foto_1\.png$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Key": "profile-images/u1/x.png" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/usuarios"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server, local);
        provider.login("ana@example.com", "segredo").await.unwrap();
        let profile = provider
            .upload_profile_image("C:\\fotos\\foto 1.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();

        let url = profile.photo_url.unwrap();
        assert!(url.starts_with(&format!(
            "{}/storage/v1/object/public/profile-images/u1/",
            server.uri()
        )));
        assert!(url.ends_with("_foto_1.png"));
    }
}
