//! Group persistence strategies
//!
//! [`GroupRepository`] is what the rest of the application talks to. The
//! strategy is picked when the client is built:
//!
//! - [`OfflineFirstGroupRepository`]: cloud when reachable, local mirror
//!   and pending queue otherwise, replayed by `sync`
//! - [`CloudGroupRepository`]: cloud only
//! - [`LocalGroupRepository`]: mirror and queue only
//!
//! [`GroupStore`] is the seam to the cloud collection.

mod cloud;
mod local;
mod memory;
mod offline;

pub use cloud::{CloudGroupRepository, PostgrestGroupStore};
pub use local::LocalGroupRepository;
pub use memory::MemoryGroupStore;
pub use offline::OfflineFirstGroupRepository;

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::models::{Group, GroupPatch, NewGroup};
use crate::offline::PendingOp;

/// Whether a write reached the cloud or is waiting in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing is left pending for the record.
    Synced,
    /// The mutation waits for the next sync.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub local_id: String,
    pub cloud_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub op: PendingOp,
    pub id: String,
    pub message: String,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.op, self.id, self.message)
    }
}

/// Outcome of replaying the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The cloud was unreachable and nothing was attempted.
    pub offline: bool,
    pub created: Vec<IdMapping>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Updates left for a later pass because their creation is unconfirmed.
    pub deferred: Vec<String>,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.offline && self.failures.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn cloud_id_for(&self, local_id: &str) -> Option<&str> {
        self.created
            .iter()
            .find(|m| m.local_id == local_id)
            .map(|m| m.cloud_id.as_str())
    }

    fn fail(&mut self, op: PendingOp, id: &str, error: impl fmt::Display) {
        self.failures.push(SyncFailure {
            op,
            id: id.to_string(),
            message: error.to_string(),
        });
    }
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// Groups the user created or participates in.
    async fn list(&self, user_id: &str) -> Result<Vec<Group>>;

    async fn get(&self, id: &str) -> Result<Option<Group>>;

    async fn create(&self, group: NewGroup) -> Result<Group>;

    async fn update(&self, id: &str, patch: GroupPatch) -> Result<WriteOutcome>;

    async fn delete(&self, id: &str) -> Result<WriteOutcome>;

    /// Replays pending mutations against the cloud.
    async fn sync(&self, user_id: &str) -> Result<SyncReport>;
}

/// Cloud side of the `teatros` collection.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn by_creator(&self, user_id: &str) -> Result<Vec<Group>>;

    async fn by_participant(&self, user_id: &str) -> Result<Vec<Group>>;

    async fn fetch(&self, id: &str) -> Result<Option<Group>>;

    /// Inserts the group; the stored copy carries the cloud id.
    async fn insert(&self, group: &Group) -> Result<Group>;

    async fn update(&self, id: &str, patch: &GroupPatch) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Groups where the user is creator or participant, deduplicated by id.
pub(crate) async fn cloud_listing<S: GroupStore + ?Sized>(
    store: &S,
    user_id: &str,
) -> Result<Vec<Group>> {
    let mut groups = store.by_creator(user_id).await?;
    for group in store.by_participant(user_id).await? {
        if !groups.iter().any(|g| g.id == group.id) {
            groups.push(group);
        }
    }
    Ok(groups)
}
