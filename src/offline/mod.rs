//! Local mirror of the user's groups and the queue of mutations waiting
//! for the cloud

mod cache;
mod queue;

pub use cache::OfflineCache;
pub use queue::{PendingEntry, PendingOp};

use chrono::Utc;
use rand::Rng;

/// Key of the mirrored group list.
pub const MIRROR_KEY: &str = "teatros_offline";

/// Key of the monotonic counter ordering pending entries.
pub const SEQ_KEY: &str = "pending_seq";

const LOCAL_PREFIX: &str = "local_";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// True for provisional ids minted while offline.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// `local_{millis}_{5 base36 chars}`
pub fn new_local_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}{}_{}", LOCAL_PREFIX, Utc::now().timestamp_millis(), suffix)
}
