use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::{GroupRepository, SyncReport, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Group, GroupPatch, NewGroup};
use crate::offline::{is_local_id, OfflineCache, PendingOp};

/// Mirror-only strategy. Every mutation is queued and nothing is ever sent;
/// a client built later in offline-first mode replays the queue.
pub struct LocalGroupRepository {
    cache: Arc<OfflineCache>,
}

impl LocalGroupRepository {
    pub fn new(cache: Arc<OfflineCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }
}

#[async_trait]
impl GroupRepository for LocalGroupRepository {
    async fn list(&self, user_id: &str) -> Result<Vec<Group>> {
        self.cache.groups_for(user_id).await
    }

    async fn get(&self, id: &str) -> Result<Option<Group>> {
        self.cache.find(id).await
    }

    async fn create(&self, group: NewGroup) -> Result<Group> {
        group.validate()?;
        self.cache.create_local(group).await
    }

    async fn update(&self, id: &str, mut patch: GroupPatch) -> Result<WriteOutcome> {
        patch.updated_at = Some(Utc::now());
        if !self.cache.patch_mirror(id, &patch).await? {
            return Err(Error::not_found(format!("group {}", id)));
        }
        self.cache.queue_update(id, &patch).await?;
        Ok(WriteOutcome::Queued)
    }

    async fn delete(&self, id: &str) -> Result<WriteOutcome> {
        self.cache.remove_from_mirror(id).await?;
        if is_local_id(id) {
            self.cache.discard_local(id).await?;
            Ok(WriteOutcome::Synced)
        } else {
            self.cache.queue_delete(id).await?;
            Ok(WriteOutcome::Queued)
        }
    }

    async fn sync(&self, _user_id: &str) -> Result<SyncReport> {
        Ok(SyncReport::offline())
    }
}
