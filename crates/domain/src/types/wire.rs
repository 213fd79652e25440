//! Wire shapes of the sync protocol.
//!
//! Push bodies and pull bodies use the server's camelCase envelope; row
//! changes inside commits arrive snake_cased. The renames below pin the
//! exact field names so the structs round-trip byte-compatibly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::outbox::{OpKind, Operation};
use super::subscription::{BootstrapState, ScopeMap, SubscriptionStatus};

// ============================================================================
// Push
// ============================================================================

/// Push body of a combined sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub client_commit_id: String,
    pub operations: Vec<Operation>,
    pub schema_version: i32,
}

/// Server disposition of a pushed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    /// Commit applied.
    Applied,
    /// Idempotent replay of an already-applied `clientCommitId`.
    Cached,
    Rejected,
}

/// Per-operation outcome within a push response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpResultStatus {
    Applied,
    Conflict,
    Error,
}

/// Result entry for one operation of a rejected (or partially applied)
/// commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    #[serde(rename = "opIndex")]
    pub op_index: i32,
    pub status: OpResultStatus,
    /// Conflict detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_row: Option<Value>,
    /// Error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriable: Option<bool>,
}

/// Push response as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: PushStatus,
    #[serde(rename = "commitSeq", skip_serializing_if = "Option::is_none")]
    pub commit_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<OpResult>,
    /// Fields this client does not interpret, preserved for diagnostics.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PushResponse {
    /// True when every non-applied result is flagged retriable.
    pub fn all_errors_retriable(&self) -> bool {
        let mut saw_failure = false;
        for result in &self.results {
            match result.status {
                OpResultStatus::Applied => {}
                OpResultStatus::Conflict => return false,
                OpResultStatus::Error => {
                    saw_failure = true;
                    if !result.retriable.unwrap_or(false) {
                        return false;
                    }
                }
            }
        }
        saw_failure
    }

    /// Concatenated message of all failed results.
    pub fn failure_message(&self) -> String {
        let parts: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.status != OpResultStatus::Applied)
            .map(|r| {
                let detail = r
                    .message
                    .as_deref()
                    .or(r.error.as_deref())
                    .unwrap_or("unspecified failure");
                format!("op {}: {}", r.op_index, detail)
            })
            .collect();
        parts.join("; ")
    }
}

// ============================================================================
// Pull
// ============================================================================

/// One subscription entry of a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSubscription {
    pub id: String,
    pub table: String,
    pub scopes: ScopeMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// −1 requests a bootstrap.
    pub cursor: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<BootstrapState>,
}

/// Pull body of a combined sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub limit_commits: u32,
    pub limit_snapshot_rows: u32,
    pub max_snapshot_pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_rows: Option<bool>,
    pub subscriptions: Vec<PullRequestSubscription>,
}

/// One row change inside an incremental commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub row_id: String,
    pub op: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<ScopeMap>,
}

/// One server commit delivered incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    #[serde(rename = "commitSeq")]
    pub commit_seq: i64,
    #[serde(rename = "actorId", default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Value>,
    pub changes: Vec<RowChange>,
}

/// Compression applied to a snapshot chunk's byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkCompression {
    #[default]
    None,
    Gzip,
}

/// Descriptor of an addressable snapshot chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: String,
    #[serde(rename = "byteLength")]
    pub byte_length: u64,
    /// Hex digest over the transport bytes (the gzip envelope when
    /// compressed). Absent means no verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub encoding: String,
    #[serde(default)]
    pub compression: ChunkCompression,
}

/// One snapshot page, carrying inline rows or chunk descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPage {
    pub table: String,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkDescriptor>>,
    #[serde(rename = "isFirstPage")]
    pub is_first_page: bool,
    #[serde(rename = "isLastPage")]
    pub is_last_page: bool,
}

/// Per-subscription section of a pull response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<ScopeMap>,
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(rename = "bootstrapState", default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<BootstrapState>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: i64,
    #[serde(default)]
    pub commits: Vec<CommitEntry>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotPage>,
}

impl PullSubscription {
    /// Whether this section signals more data is immediately available.
    pub fn has_more(&self) -> bool {
        self.bootstrap || !self.commits.is_empty()
    }
}

/// Pull response as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub ok: bool,
    #[serde(default)]
    pub subscriptions: Vec<PullSubscription>,
}

// ============================================================================
// Combined envelope
// ============================================================================

/// Combined request sent to the transport's `sync` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullRequest>,
}

/// Combined response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullResponse>,
}

// ============================================================================
// Realtime
// ============================================================================

/// Payload of a realtime `sync` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSyncData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<RowChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Event delivered over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum RealtimeEvent {
    Sync(RealtimeSyncData),
}

/// Connection state reported by the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_response_parses_spec_shape() {
        let raw = serde_json::json!({
            "ok": true,
            "subscriptions": [{
                "id": "sub-1",
                "status": "active",
                "scopes": {},
                "bootstrap": true,
                "bootstrapState": null,
                "nextCursor": 1,
                "commits": [],
                "snapshots": [{
                    "table": "items",
                    "rows": [{"id": "1", "name": "A"}],
                    "isFirstPage": true,
                    "isLastPage": true
                }]
            }]
        });

        let response: PullResponse = serde_json::from_value(raw).unwrap();
        let sub = &response.subscriptions[0];
        assert!(sub.bootstrap);
        assert!(sub.has_more());
        assert_eq!(sub.next_cursor, 1);
        assert_eq!(sub.snapshots[0].rows.len(), 1);
        assert!(sub.snapshots[0].chunks.is_none());
    }

    #[test]
    fn commit_changes_parse_snake_case() {
        let raw = serde_json::json!({
            "commitSeq": 7,
            "actorId": "actor-1",
            "changes": [{
                "table": "items",
                "row_id": "1",
                "op": "upsert",
                "row_json": {"id": "1"},
                "row_version": 3
            }]
        });

        let commit: CommitEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(commit.commit_seq, 7);
        assert_eq!(commit.changes[0].row_id, "1");
        assert_eq!(commit.changes[0].row_version, Some(3));
    }

    #[test]
    fn all_errors_retriable_partitioning() {
        let retriable = OpResult {
            op_index: 0,
            status: OpResultStatus::Error,
            message: None,
            server_version: None,
            server_row: None,
            error: Some("busy".into()),
            code: None,
            retriable: Some(true),
        };
        let terminal = OpResult { retriable: Some(false), op_index: 1, ..retriable.clone() };
        let conflict = OpResult {
            status: OpResultStatus::Conflict,
            message: Some("version mismatch".into()),
            op_index: 2,
            ..retriable.clone()
        };

        let mut response = PushResponse {
            status: PushStatus::Rejected,
            commit_seq: None,
            results: vec![retriable.clone()],
            extra: serde_json::Map::new(),
        };
        assert!(response.all_errors_retriable());

        response.results.push(terminal);
        assert!(!response.all_errors_retriable());

        response.results = vec![retriable, conflict];
        assert!(!response.all_errors_retriable());
    }

    #[test]
    fn realtime_event_envelope() {
        let raw = serde_json::json!({
            "event": "sync",
            "data": {"cursor": 12, "changes": [], "timestamp": 1_700_000_000_000_i64}
        });
        let event: RealtimeEvent = serde_json::from_value(raw).unwrap();
        let RealtimeEvent::Sync(data) = event;
        assert_eq!(data.cursor, Some(12));
    }

    #[test]
    fn chunk_descriptor_defaults() {
        let raw = serde_json::json!({
            "id": "chunk-1",
            "byteLength": 1024,
            "encoding": "json-row-frame-v1"
        });
        let chunk: ChunkDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(chunk.compression, ChunkCompression::None);
        assert!(chunk.sha256.is_none());
    }
}
