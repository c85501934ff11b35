//! Object storage client for the ServeFirst backend
//!
//! Uploads binary objects (profile pictures) to a bucket of the
//! Supabase-compatible storage API and builds their public URLs.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use url::Url;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FileOptions {
    pub cache_control: Option<String>,
    pub content_type: Option<String>,
    pub upsert: Option<bool>,
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_control(mut self, cache_control: &str) -> Self {
        self.cache_control = Some(cache_control.to_string());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = Some(upsert);
        self
    }
}

/// Body returned by a successful upload
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UploadResponse {
    #[serde(rename = "Key")]
    pub key: String,
}

pub struct StorageClient {
    base_url: String,
    api_key: String,
    bearer: String,
    http_client: Client,
}

pub struct StorageBucketClient<'a> {
    parent: &'a StorageClient,
    bucket_id: String,
}

impl StorageClient {
    pub fn new(base_url: &str, api_key: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bearer: api_key.to_string(),
            http_client,
        }
    }

    /// Uses a user access token as bearer so bucket policies see the user.
    pub fn with_auth(mut self, token: &str) -> Self {
        self.bearer = token.to_string();
        self
    }

    pub fn from<'a>(&'a self, bucket_id: &str) -> StorageBucketClient<'a> {
        StorageBucketClient {
            parent: self,
            bucket_id: bucket_id.to_string(),
        }
    }
}

impl<'a> StorageBucketClient<'a> {
    fn object_url(&self, path: &str) -> Result<Url> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let mut url = Url::parse(&self.parent.base_url)?;
        url.set_path(&format!("/storage/v1/object/{}/{}", self.bucket_id, path));
        Ok(url)
    }

    /// Uploads an in-memory object.
    pub async fn upload_bytes(
        &self,
        path: &str,
        contents: Vec<u8>,
        options: Option<FileOptions>,
    ) -> Result<UploadResponse> {
        let mut url = self.object_url(path)?;
        let options = options.unwrap_or_default();

        if let Some(cache_control) = &options.cache_control {
            url.query_pairs_mut()
                .append_pair("cache_control", cache_control);
        }

        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let mut part = Part::bytes(contents).file_name(file_name);
        if let Some(content_type) = &options.content_type {
            part = part.mime_str(content_type)?;
        }
        let form = Form::new().part("file", part);

        let mut request = self
            .parent
            .http_client
            .post(url)
            .header("apikey", &self.parent.api_key)
            .header("Authorization", format!("Bearer {}", &self.parent.bearer));
        if options.upsert.unwrap_or(false) {
            request = request.header("x-upsert", "true");
        }

        let response = request.multipart(form).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(StorageError::ApiError(error_text));
        }

        let uploaded = response.json::<UploadResponse>().await?;
        log::debug!("uploaded {}", uploaded.key);
        Ok(uploaded)
    }

    /// Uploads the content of a local file.
    pub async fn upload(
        &self,
        path: &str,
        file_path: &Path,
        options: Option<FileOptions>,
    ) -> Result<UploadResponse> {
        let mut file = File::open(file_path).await?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;

        self.upload_bytes(path, contents, options).await
    }

    pub async fn remove(&self, paths: Vec<&str>) -> Result<()> {
        let url = format!(
            "{}/storage/v1/object/{}",
            self.parent.base_url, self.bucket_id
        );

        let payload = serde_json::json!({
            "prefixes": paths
        });

        let response = self
            .parent
            .http_client
            .delete(&url)
            .header("apikey", &self.parent.api_key)
            .header("Authorization", format!("Bearer {}", &self.parent.bearer))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(StorageError::ApiError(error_text));
        }

        Ok(())
    }

    /// URL of an object in a public bucket; no request is made.
    pub fn get_public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.parent.base_url, self.bucket_id, path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_upload_bytes_with_user_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/profile-images/user-1/avatar.png"))
            .and(header("Authorization", "Bearer user-token"))
            .and(header("x-upsert", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Key": "profile-images/user-1/avatar.png"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let storage =
            StorageClient::new(&mock_server.uri(), "fake-key", Client::new()).with_auth("user-token");

        let uploaded = storage
            .from("profile-images")
            .upload_bytes(
                "user-1/avatar.png",
                vec![0x89, 0x50, 0x4e, 0x47],
                Some(
                    FileOptions::new()
                        .with_content_type("image/png")
                        .with_upsert(true),
                ),
            )
            .await
            .unwrap();

        assert_eq!(uploaded.key, "profile-images/user-1/avatar.png");
    }

    #[tokio::test]
    async fn test_upload_error_body_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/profile-images/user-1/a.png"))
            .respond_with(ResponseTemplate::new(403).set_body_string("new row violates policy"))
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "fake-key", Client::new());
        let err = storage
            .from("profile-images")
            .upload_bytes("user-1/a.png", vec![1, 2, 3], None)
            .await
            .unwrap_err();

        match err {
            StorageError::ApiError(msg) => assert!(msg.contains("violates policy")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_from_file() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/profile-images/user-2/photo.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Key": "profile-images/user-2/photo.jpg"
            })))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("photo.jpg");
        std::fs::write(&file_path, b"jpeg-bytes").unwrap();

        let storage = StorageClient::new(&mock_server.uri(), "fake-key", Client::new());
        let uploaded = storage
            .from("profile-images")
            .upload("user-2/photo.jpg", &file_path, None)
            .await
            .unwrap();

        assert_eq!(uploaded.key, "profile-images/user-2/photo.jpg");
    }

    #[tokio::test]
    async fn test_invalid_paths_are_rejected() {
        let storage = StorageClient::new("http://localhost:54321", "fake-key", Client::new());
        let bucket = storage.from("profile-images");

        for bad in ["", "/abs.png", "../escape.png", "a/../../b.png"] {
            let result = bucket.upload_bytes(bad, vec![1], None).await;
            assert!(matches!(result, Err(StorageError::InvalidPath(_))), "{}", bad);
        }
    }

    #[test]
    fn test_public_url() {
        let storage = StorageClient::new("https://demo.supabase.co/", "fake-key", Client::new());
        assert_eq!(
            storage.from("profile-images").get_public_url("u/a.png"),
            "https://demo.supabase.co/storage/v1/object/public/profile-images/u/a.png"
        );
    }

    #[tokio::test]
    async fn test_remove_objects() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/profile-images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "fake-key", Client::new());
        storage
            .from("profile-images")
            .remove(vec!["user-1/avatar.png"])
            .await
            .unwrap();
    }
}
