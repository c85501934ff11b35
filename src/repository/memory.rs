use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::GroupStore;
use crate::error::{Error, Result};
use crate::models::{Group, GroupPatch};

#[derive(Default)]
struct Inner {
    groups: Mutex<BTreeMap<String, Group>>,
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
    next_id: AtomicU64,
}

/// In-process stand-in for the cloud collection.
///
/// `set_failing(true)` makes every call fail as if the network were down.
/// Every call is recorded (`"update g1"`, `"insert Hamlet"`, ...).
#[derive(Clone, Default)]
pub struct MemoryGroupStore {
    inner: Arc<Inner>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_failing(&self) -> bool {
        self.inner.failing.load(Ordering::SeqCst)
    }

    /// Stores a group as if it had been created elsewhere.
    pub fn seed(&self, group: Group) {
        self.groups().insert(group.id.clone(), group);
    }

    pub fn snapshot(&self) -> Vec<Group> {
        self.groups().values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear_calls(&self) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn groups(&self) -> MutexGuard<'_, BTreeMap<String, Group>> {
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: String) -> Result<()> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
        if self.is_failing() {
            Err(Error::Offline("group store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn by_creator(&self, user_id: &str) -> Result<Vec<Group>> {
        self.record(format!("by_creator {}", user_id))?;
        Ok(self
            .groups()
            .values()
            .filter(|g| g.creator == user_id)
            .cloned()
            .collect())
    }

    async fn by_participant(&self, user_id: &str) -> Result<Vec<Group>> {
        self.record(format!("by_participant {}", user_id))?;
        Ok(self
            .groups()
            .values()
            .filter(|g| g.participants.iter().any(|p| p == user_id))
            .cloned()
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<Group>> {
        self.record(format!("fetch {}", id))?;
        Ok(self.groups().get(id).cloned())
    }

    async fn insert(&self, group: &Group) -> Result<Group> {
        self.record(format!("insert {}", group.title))?;
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = group.clone();
        stored.id = format!("cloud-{}", n);
        stored.ensure_creator_participant();
        self.groups().insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: &str, patch: &GroupPatch) -> Result<()> {
        self.record(format!("update {}", id))?;
        // Like PostgREST, patching a missing row matches nothing.
        if let Some(group) = self.groups().get_mut(id) {
            patch.apply_to(group);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.record(format!("delete {}", id))?;
        self.groups().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewGroup;
    use chrono::Utc;

    #[tokio::test]
    async fn assigns_cloud_ids_and_records_calls() {
        let store = MemoryGroupStore::new();
        let group = NewGroup::new("Hamlet", "u1").into_group(String::new(), Utc::now());
        let stored = store.insert(&group).await.unwrap();
        assert_eq!(stored.id, "cloud-1");

        store
            .update("cloud-1", &GroupPatch::default().title("Hamlet II"))
            .await
            .unwrap();
        assert_eq!(store.snapshot()[0].title, "Hamlet II");
        assert_eq!(store.calls(), vec!["insert Hamlet", "update cloud-1"]);
    }

    #[tokio::test]
    async fn failing_store_reports_connectivity() {
        let store = MemoryGroupStore::new();
        store.set_failing(true);
        let err = store.by_creator("u1").await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
