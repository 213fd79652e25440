//! Outbox commit and operation types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TidesyncError;

/// Lifecycle status of an outbox commit.
///
/// Transitions follow `pending → sending → {acked | failed | pending}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Acked,
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Acked => "acked",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxStatus {
    type Err = TidesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "acked" => Ok(Self::Acked),
            "failed" => Ok(Self::Failed),
            other => Err(TidesyncError::InvalidInput(format!("unknown outbox status: {other}"))),
        }
    }
}

/// Kind of a single-row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Upsert,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert => f.write_str("upsert"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// A single-row upsert or delete with an optional optimistic-concurrency
/// guard.
///
/// `base_version = None` means "do not check"; any integer is compared by
/// the server against the row's current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub table: String,
    pub row_id: String,
    pub op: OpKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
}

impl Operation {
    pub fn upsert(table: impl Into<String>, row_id: impl Into<String>, payload: Value) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            op: OpKind::Upsert,
            payload: Some(payload),
            base_version: None,
        }
    }

    pub fn delete(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            op: OpKind::Delete,
            payload: None,
            base_version: None,
        }
    }

    pub fn with_base_version(mut self, version: i64) -> Self {
        self.base_version = Some(version);
        self
    }
}

/// A durable client-authored commit awaiting server acknowledgement.
#[derive(Debug, Clone)]
pub struct OutboxCommit {
    pub id: String,
    /// Client-chosen idempotency id; unique per store.
    pub client_commit_id: String,
    pub status: OutboxStatus,
    pub operations: Vec<Operation>,
    /// Last raw server response, kept opaque for diagnostics.
    pub last_response: Option<Value>,
    pub error: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub updated_at: i64,
    pub attempt_count: i32,
    /// Server-assigned commit sequence, set only when acked.
    pub acked_commit_seq: Option<i64>,
    pub schema_version: i32,
}

/// Receipt returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub id: String,
    pub client_commit_id: String,
}

/// Which terminal commits a cleanup pass removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTarget {
    Acked,
    Failed,
    All,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Sending,
            OutboxStatus::Acked,
            OutboxStatus::Failed,
        ] {
            let parsed: OutboxStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("shipped".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn operations_serialize_camel_case() {
        let op = Operation::upsert("items", "row-1", serde_json::json!({"name": "A"}))
            .with_base_version(3);
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["rowId"], "row-1");
        assert_eq!(json["baseVersion"], 3);
        assert_eq!(json["op"], "upsert");
    }

    #[test]
    fn delete_has_no_payload() {
        let op = Operation::delete("items", "row-2");
        let json = serde_json::to_value(&op).unwrap();
        assert!(json.get("payload").is_none());
    }
}
