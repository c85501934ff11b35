use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::LocalStore;
use crate::error::{Error, Result};

const FILE_NAME: &str = "servefirst-store.json";

/// Store persisted as one JSON object in `data_dir`.
///
/// Every write rewrites the whole file through a temporary file and a
/// rename. Two processes sharing a directory are not coordinated; the last
/// writer wins.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store, creating the directory when needed.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(FILE_NAME);

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::local_store(format!("corrupt store file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened local store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    // Writes go to a copy first; memory only changes once the file has.
    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("teatros_offline", "[]".to_string()).await.unwrap();
        store.set("auth_session", "{}".to_string()).await.unwrap();
        store.remove("auth_session").await.unwrap();
        drop(store);

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("teatros_offline").await.unwrap().as_deref(),
            Some("[]")
        );
        assert_eq!(reopened.get("auth_session").await.unwrap(), None);
        assert!(!dir.path().join("servefirst-store.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = FileStore::open(&nested).await.unwrap();
        store.set("k", "v".to_string()).await.unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_and_disk_unchanged() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("kept", "1".to_string()).await.unwrap();

        // A directory in place of the temporary file makes every write fail.
        let blocker = dir.path().join("servefirst-store.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(store.set("lost", "2".to_string()).await.is_err());
        assert!(store.remove("kept").await.is_err());
        assert_eq!(store.get("lost").await.unwrap(), None);
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("1"));

        std::fs::remove_dir(&blocker).unwrap();
        store.set("later", "3".to_string()).await.unwrap();

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let mut keys = reopened.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["kept", "later"]);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), "{ nope").unwrap();
        let err = FileStore::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::LocalStore(_)));
    }
}
