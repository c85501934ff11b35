use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOp {
    Create,
    Update,
    Delete,
}

impl PendingOp {
    pub fn prefix(&self) -> &'static str {
        match self {
            PendingOp::Create => "pending_create_",
            PendingOp::Update => "pending_update_",
            PendingOp::Delete => "pending_delete_",
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix(), id)
    }
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::Create => f.write_str("create"),
            PendingOp::Update => f.write_str("update"),
            PendingOp::Delete => f.write_str("delete"),
        }
    }
}

/// A mutation not yet confirmed by the cloud.
///
/// `payload` is the full group document for creations, the patch document
/// for updates and `null` for deletions. Entries are replayed in `seq`
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub op: PendingOp,
    pub id: String,
    pub seq: u64,
    #[serde(default)]
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
}

impl PendingEntry {
    pub fn key(&self) -> String {
        self.op.key(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_follow_operation_prefix() {
        assert_eq!(PendingOp::Create.key("local_1_abcde"), "pending_create_local_1_abcde");
        assert_eq!(PendingOp::Update.key("g1"), "pending_update_g1");
        assert_eq!(PendingOp::Delete.key("g1"), "pending_delete_g1");
    }

    #[test]
    fn entry_document_shape() {
        let entry = PendingEntry {
            op: PendingOp::Delete,
            id: "g1".into(),
            seq: 3,
            payload: Value::Null,
            queued_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "op": "delete",
                "id": "g1",
                "seq": 3,
                "payload": null,
                "queued_at": "2024-01-01T00:00:00Z"
            })
        );
        assert_eq!(entry.key(), "pending_delete_g1");
    }
}
