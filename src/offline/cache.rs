use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::queue::{PendingEntry, PendingOp};
use super::{is_local_id, new_local_id, MIRROR_KEY, SEQ_KEY};
use crate::error::{Error, Result};
use crate::local::{read_json, write_json, LocalStore};
use crate::models::{Group, GroupPatch, NewGroup};

/// Mirror and pending queue on top of a [`LocalStore`].
///
/// Read-modify-write sequences are serialized by an internal lock, so one
/// process never loses its own writes. Separate processes sharing a store
/// are not coordinated.
pub struct OfflineCache {
    store: Arc<dyn LocalStore>,
    write_lock: Mutex<()>,
}

impl OfflineCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Mirrored groups; an absent or unreadable mirror reads as empty.
    pub async fn mirror(&self) -> Result<Vec<Group>> {
        let documents = match read_json::<Vec<Value>>(self.store.as_ref(), MIRROR_KEY).await {
            Ok(Some(documents)) => documents,
            Ok(None) => return Ok(Vec::new()),
            Err(Error::LocalStore(msg)) => {
                warn!("ignoring unreadable mirror: {}", msg);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(documents
            .into_iter()
            .filter_map(|doc| match Group::from_document(doc) {
                Ok(group) => Some(group),
                Err(e) => {
                    warn!("skipping malformed mirror entry: {}", e);
                    None
                }
            })
            .collect())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Group>> {
        Ok(self.mirror().await?.into_iter().find(|g| g.id == id))
    }

    /// Mirrored groups the user created or participates in.
    pub async fn groups_for(&self, user_id: &str) -> Result<Vec<Group>> {
        Ok(self
            .mirror()
            .await?
            .into_iter()
            .filter(|g| g.is_member(user_id))
            .collect())
    }

    pub async fn replace_mirror(&self, groups: &[Group]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_json(self.store.as_ref(), MIRROR_KEY, groups).await
    }

    /// Runs `f` against the mirror and writes the result back.
    pub async fn modify_mirror<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Group>) -> T + Send,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut groups = self.mirror().await?;
        let out = f(&mut groups);
        write_json(self.store.as_ref(), MIRROR_KEY, &groups).await?;
        Ok(out)
    }

    pub async fn entry(&self, op: PendingOp, id: &str) -> Result<Option<PendingEntry>> {
        read_json(self.store.as_ref(), &op.key(id)).await
    }

    pub async fn has_pending(&self, op: PendingOp, id: &str) -> Result<bool> {
        Ok(self.store.get(&op.key(id)).await?.is_some())
    }

    /// Pending entries of one kind, oldest first.
    pub async fn pending(&self, op: PendingOp) -> Result<Vec<PendingEntry>> {
        let mut entries = Vec::new();
        for key in self.store.keys_with_prefix(op.prefix()).await? {
            match read_json::<PendingEntry>(self.store.as_ref(), &key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable queue entry {}: {}", key, e),
            }
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Every pending entry, oldest first.
    pub async fn all_pending(&self) -> Result<Vec<PendingEntry>> {
        let mut entries = Vec::new();
        for op in [PendingOp::Create, PendingOp::Update, PendingOp::Delete] {
            entries.extend(self.pending(op).await?);
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    // Caller holds `write_lock`.
    async fn next_seq(&self) -> Result<u64> {
        let current = read_json::<u64>(self.store.as_ref(), SEQ_KEY)
            .await?
            .unwrap_or(0);
        let next = current + 1;
        write_json(self.store.as_ref(), SEQ_KEY, &next).await?;
        Ok(next)
    }

    async fn put_entry(&self, op: PendingOp, id: &str, payload: Value) -> Result<PendingEntry> {
        let entry = PendingEntry {
            op,
            id: id.to_string(),
            seq: self.next_seq().await?,
            payload,
            queued_at: Utc::now(),
        };
        write_json(self.store.as_ref(), &entry.key(), &entry).await?;
        debug!(op = %op, id, seq = entry.seq, "queued pending entry");
        Ok(entry)
    }

    pub async fn queue_create(&self, group: &Group) -> Result<PendingEntry> {
        let _guard = self.write_lock.lock().await;
        let payload = serde_json::to_value(group)?;
        self.put_entry(PendingOp::Create, &group.id, payload).await
    }

    /// Records an update; an existing entry for the same id is merged with
    /// the later fields winning and moves to the back of the queue.
    pub async fn queue_update(&self, id: &str, patch: &GroupPatch) -> Result<PendingEntry> {
        let _guard = self.write_lock.lock().await;
        let merged = match read_json::<PendingEntry>(self.store.as_ref(), &PendingOp::Update.key(id))
            .await
        {
            Ok(Some(existing)) => match serde_json::from_value::<GroupPatch>(existing.payload) {
                Ok(earlier) => earlier.merge(patch.clone()),
                Err(e) => {
                    warn!("replacing unreadable pending update for {}: {}", id, e);
                    patch.clone()
                }
            },
            Ok(None) => patch.clone(),
            Err(e) => {
                warn!("replacing unreadable pending update for {}: {}", id, e);
                patch.clone()
            }
        };
        let payload = serde_json::to_value(&merged)?;
        self.put_entry(PendingOp::Update, id, payload).await
    }

    /// Records a deletion and drops any pending update for the same id.
    pub async fn queue_delete(&self, id: &str) -> Result<PendingEntry> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(&PendingOp::Update.key(id)).await?;
        self.put_entry(PendingOp::Delete, id, Value::Null).await
    }

    pub async fn clear(&self, op: PendingOp, id: &str) -> Result<()> {
        self.store.remove(&op.key(id)).await
    }

    /// Clears a replayed entry unless it changed meanwhile. A write queued
    /// for the same id while the replay was in flight carries a newer `seq`
    /// and stays for the next sync. True when the entry was removed.
    pub async fn clear_replayed(&self, replayed: &PendingEntry) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = replayed.key();
        let current = read_json::<PendingEntry>(self.store.as_ref(), &key).await?;
        if let Some(current) = current.filter(|c| c.seq != replayed.seq) {
            debug!(
                key = %key,
                replayed = replayed.seq,
                current = current.seq,
                "pending entry changed during replay, keeping it"
            );
            return Ok(false);
        }
        self.store.remove(&key).await?;
        Ok(true)
    }

    /// Drops the create and update entries of a never-synced group.
    pub async fn discard_local(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(&PendingOp::Create.key(id)).await?;
        self.store.remove(&PendingOp::Update.key(id)).await?;
        Ok(())
    }

    /// Moves everything addressed by `local_id` to the cloud id: the mirror
    /// entry and any pending update. Clears the pending creation.
    pub async fn readdress(&self, local_id: &str, cloud_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut groups = self.mirror().await?;
        // The cloud copy may already be mirrored by a concurrent list.
        groups.retain(|g| g.id != cloud_id || local_id == cloud_id);
        for group in groups.iter_mut().filter(|g| g.id == local_id) {
            group.id = cloud_id.to_string();
        }
        write_json(self.store.as_ref(), MIRROR_KEY, &groups).await?;

        let update_key = PendingOp::Update.key(local_id);
        if let Some(mut entry) = read_json::<PendingEntry>(self.store.as_ref(), &update_key).await? {
            entry.id = cloud_id.to_string();
            write_json(self.store.as_ref(), &entry.key(), &entry).await?;
            self.store.remove(&update_key).await?;
        }

        self.store.remove(&PendingOp::Create.key(local_id)).await
    }

    /// Offline creation: a provisional id, a mirror entry and a pending
    /// creation entry.
    pub async fn create_local(&self, new_group: NewGroup) -> Result<Group> {
        let group = new_group.into_group(new_local_id(), Utc::now());
        let stored = group.clone();
        self.modify_mirror(move |groups| groups.push(stored)).await?;
        self.queue_create(&group).await?;
        debug!(id = %group.id, "created group locally");
        Ok(group)
    }

    /// Applies the patch to the mirrored copy; false when the id is not
    /// mirrored.
    pub async fn patch_mirror(&self, id: &str, patch: &GroupPatch) -> Result<bool> {
        let patch = patch.clone();
        self.modify_mirror(move |groups| {
            match groups.iter_mut().find(|g| g.id == id) {
                Some(group) => {
                    patch.apply_to(group);
                    true
                }
                None => false,
            }
        })
        .await
    }

    /// Removes the mirrored copy; false when it was not mirrored.
    pub async fn remove_from_mirror(&self, id: &str) -> Result<bool> {
        self.modify_mirror(|groups| {
            let before = groups.len();
            groups.retain(|g| g.id != id);
            groups.len() != before
        })
        .await
    }

    /// Cloud copy as this device sees it: `None` when a deletion is
    /// pending, patched when an update is.
    pub async fn overlay_pending(&self, mut group: Group) -> Result<Option<Group>> {
        if self.has_pending(PendingOp::Delete, &group.id).await? {
            return Ok(None);
        }
        if let Some(entry) = self.entry(PendingOp::Update, &group.id).await? {
            match serde_json::from_value::<GroupPatch>(entry.payload) {
                Ok(patch) => patch.apply_to(&mut group),
                Err(e) => warn!("ignoring unreadable pending update for {}: {}", group.id, e),
            }
        }
        Ok(Some(group))
    }

    /// Replaces the mirror with a fresh cloud listing merged with the queue.
    /// Merge and write happen under one lock so concurrent mirror writes
    /// are not overwritten.
    pub async fn refresh_mirror(&self, cloud: Vec<Group>) -> Result<Vec<Group>> {
        let _guard = self.write_lock.lock().await;
        let merged = self.merge_cloud_listing(cloud).await?;
        write_json(self.store.as_ref(), MIRROR_KEY, &merged).await?;
        Ok(merged)
    }

    /// Overlays the queue on a fresh cloud listing: local creations still
    /// pending are kept, pending updates are re-applied and pending
    /// deletions stay hidden.
    async fn merge_cloud_listing(&self, cloud: Vec<Group>) -> Result<Vec<Group>> {
        let mut merged = Vec::with_capacity(cloud.len());
        for group in cloud {
            if let Some(group) = self.overlay_pending(group).await? {
                merged.push(group);
            }
        }

        for group in self.mirror().await? {
            if is_local_id(&group.id)
                && self.has_pending(PendingOp::Create, &group.id).await?
                && !merged.iter().any(|g| g.id == group.id)
            {
                merged.push(group);
            }
        }
        Ok(merged)
    }
}
