//! String-keyed local storage
//!
//! The offline mirror, the pending mutation queue, the cached session and
//! cached profiles all live here as JSON strings under fixed keys.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// Reads and decodes a JSON value.
pub async fn read_json<T: DeserializeOwned>(store: &dyn LocalStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::local_store(format!("corrupt value under {}: {}", key, e))),
        None => Ok(None),
    }
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await
}
