use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{cloud_listing, GroupRepository, GroupStore, IdMapping, SyncReport, WriteOutcome};
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};
use crate::models::{Group, GroupPatch, NewGroup};
use crate::offline::{is_local_id, OfflineCache, PendingOp};

/// Cloud when reachable, local mirror and pending queue otherwise.
///
/// Reads never fail because of the cloud: any cloud error falls back to
/// the mirror. Writes always land in the mirror first; whatever the cloud
/// did not confirm waits in the pending queue until [`sync`] replays it.
///
/// [`sync`]: GroupRepository::sync
pub struct OfflineFirstGroupRepository<S> {
    store: S,
    cache: Arc<OfflineCache>,
    connectivity: Connectivity,
    // Held by sync and by mutations of provisional ids, which sync rewrites.
    sync_lock: Mutex<()>,
}

impl<S: GroupStore> OfflineFirstGroupRepository<S> {
    pub fn new(store: S, cache: Arc<OfflineCache>, connectivity: Connectivity) -> Self {
        Self {
            store,
            cache,
            connectivity,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Logs a swallowed cloud failure; unreachable clouds flip the client
    /// offline until the monitor sees the backend again.
    fn fall_back(&self, operation: &str, error: &Error) {
        if error.is_permission_denied() {
            warn!("{} refused by the cloud, using local data: {}", operation, error);
        } else if error.is_connectivity() {
            warn!("{} could not reach the cloud, using local data: {}", operation, error);
            self.connectivity.set_online(false);
        } else {
            warn!("{} failed in the cloud, using local data: {}", operation, error);
        }
    }

    async fn replay_creations(&self, report: &mut SyncReport) -> Result<()> {
        for entry in self.cache.pending(PendingOp::Create).await? {
            let group = match Group::from_document(entry.payload.clone()) {
                Ok(group) => group,
                Err(e) => {
                    report.fail(PendingOp::Create, &entry.id, e);
                    continue;
                }
            };
            match self.store.insert(&group).await {
                Ok(stored) => {
                    self.cache.readdress(&entry.id, &stored.id).await?;
                    debug!(local_id = %entry.id, cloud_id = %stored.id, "creation confirmed");
                    report.created.push(IdMapping {
                        local_id: entry.id,
                        cloud_id: stored.id,
                    });
                }
                Err(e) => {
                    if e.is_connectivity() {
                        self.connectivity.set_online(false);
                    }
                    report.fail(PendingOp::Create, &entry.id, e);
                }
            }
        }
        Ok(())
    }

    async fn replay_updates(&self, report: &mut SyncReport) -> Result<()> {
        for entry in self.cache.pending(PendingOp::Update).await? {
            if is_local_id(&entry.id) {
                if self.cache.has_pending(PendingOp::Create, &entry.id).await? {
                    report.deferred.push(entry.id);
                } else {
                    warn!("dropping update for unknown provisional group {}", entry.id);
                    self.cache.clear(PendingOp::Update, &entry.id).await?;
                }
                continue;
            }
            let patch: GroupPatch = match serde_json::from_value(entry.payload.clone()) {
                Ok(patch) => patch,
                Err(e) => {
                    report.fail(PendingOp::Update, &entry.id, e);
                    continue;
                }
            };
            match self.store.update(&entry.id, &patch).await {
                Ok(()) => {
                    self.cache.clear_replayed(&entry).await?;
                    report.updated.push(entry.id);
                }
                Err(e) => report.fail(PendingOp::Update, &entry.id, e),
            }
        }
        Ok(())
    }

    async fn replay_deletions(&self, report: &mut SyncReport) -> Result<()> {
        for entry in self.cache.pending(PendingOp::Delete).await? {
            match self.store.delete(&entry.id).await {
                Ok(()) => {
                    self.cache.clear_replayed(&entry).await?;
                    report.deleted.push(entry.id);
                }
                Err(e) => report.fail(PendingOp::Delete, &entry.id, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: GroupStore> GroupRepository for OfflineFirstGroupRepository<S> {
    async fn list(&self, user_id: &str) -> Result<Vec<Group>> {
        if !self.connectivity.is_online() {
            debug!("offline, listing groups from the mirror");
            return self.cache.groups_for(user_id).await;
        }

        match cloud_listing(&self.store, user_id).await {
            Ok(cloud) => {
                let merged = self.cache.refresh_mirror(cloud).await?;
                Ok(merged
                    .into_iter()
                    .filter(|g| g.is_member(user_id))
                    .collect())
            }
            Err(e) => {
                self.fall_back("listing groups", &e);
                self.cache.groups_for(user_id).await
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Group>> {
        if is_local_id(id) || !self.connectivity.is_online() {
            return self.cache.find(id).await;
        }

        match self.store.fetch(id).await {
            Ok(Some(group)) => self.cache.overlay_pending(group).await,
            Ok(None) => Ok(None),
            Err(e) => {
                self.fall_back("fetching a group", &e);
                self.cache.find(id).await
            }
        }
    }

    async fn create(&self, group: NewGroup) -> Result<Group> {
        group.validate()?;

        if self.connectivity.is_online() {
            let draft = group.clone().into_group(String::new(), Utc::now());
            match self.store.insert(&draft).await {
                Ok(stored) => {
                    let mirrored = stored.clone();
                    self.cache
                        .modify_mirror(move |groups| {
                            groups.retain(|g| g.id != mirrored.id);
                            groups.push(mirrored);
                        })
                        .await?;
                    return Ok(stored);
                }
                Err(e) => self.fall_back("creating a group", &e),
            }
        }

        self.cache.create_local(group).await
    }

    async fn update(&self, id: &str, mut patch: GroupPatch) -> Result<WriteOutcome> {
        patch.updated_at = Some(Utc::now());

        if is_local_id(id) {
            let _guard = self.sync_lock.lock().await;
            let mirrored = self.cache.patch_mirror(id, &patch).await?;
            if !mirrored && !self.cache.has_pending(PendingOp::Create, id).await? {
                return Err(Error::not_found(format!("group {}", id)));
            }
            // Replayed once the creation is confirmed.
            self.cache.queue_update(id, &patch).await?;
            return Ok(WriteOutcome::Queued);
        }

        self.cache.patch_mirror(id, &patch).await?;

        if !self.connectivity.is_online() {
            self.cache.queue_update(id, &patch).await?;
            return Ok(WriteOutcome::Queued);
        }

        // An older queued patch goes out together with this one so it cannot
        // later overwrite newer fields.
        let earlier = self.cache.entry(PendingOp::Update, id).await?;
        let outgoing = match &earlier {
            Some(entry) => match serde_json::from_value::<GroupPatch>(entry.payload.clone()) {
                Ok(queued) => queued.merge(patch.clone()),
                Err(_) => patch.clone(),
            },
            None => patch.clone(),
        };

        match self.store.update(id, &outgoing).await {
            Ok(()) => {
                if let Some(entry) = &earlier {
                    self.cache.clear_replayed(entry).await?;
                }
                Ok(WriteOutcome::Synced)
            }
            Err(e) => {
                self.fall_back("updating a group", &e);
                self.cache.queue_update(id, &patch).await?;
                Err(e)
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<WriteOutcome> {
        if is_local_id(id) {
            let _guard = self.sync_lock.lock().await;
            self.cache.remove_from_mirror(id).await?;
            self.cache.discard_local(id).await?;
            return Ok(WriteOutcome::Synced);
        }

        self.cache.remove_from_mirror(id).await?;

        if self.connectivity.is_online() {
            match self.store.delete(id).await {
                Ok(()) => {
                    self.cache.clear(PendingOp::Update, id).await?;
                    return Ok(WriteOutcome::Synced);
                }
                Err(e) => self.fall_back("deleting a group", &e),
            }
        }

        self.cache.queue_delete(id).await?;
        Ok(WriteOutcome::Queued)
    }

    async fn sync(&self, user_id: &str) -> Result<SyncReport> {
        if !self.connectivity.is_online() {
            info!("offline, sync postponed");
            return Ok(SyncReport::offline());
        }

        let mut report = SyncReport::default();
        {
            let _guard = self.sync_lock.lock().await;
            self.replay_creations(&mut report).await?;
            self.replay_updates(&mut report).await?;
            self.replay_deletions(&mut report).await?;
        }

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            deferred = report.deferred.len(),
            failed = report.failures.len(),
            "sync finished"
        );

        if report.is_success() {
            self.list(user_id).await?;
        } else {
            for failure in &report.failures {
                warn!("sync left pending: {}", failure);
            }
        }
        Ok(report)
    }
}
