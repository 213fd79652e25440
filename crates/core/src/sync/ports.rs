//! Port interfaces for sync operations.
//!
//! Repositories are implemented over SQLite in `tidesync-infra`; transports
//! are implemented by the application (HTTP, WebSocket, in-process test
//! doubles). All methods are async; repository implementations run their
//! blocking SQLite work on dedicated threads.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tidesync_domain::{
    CleanupTarget, ConflictResolution, ConflictRow, EnqueueReceipt, Operation, OutboxCommit,
    OutboxStatus, PresenceEvent, PushRequest, PushResponse, RealtimeConnectionState,
    RealtimeEvent, Result, SubscriptionState, SyncRequest, SyncResponse, TidesyncError,
};

/// Byte stream of one snapshot chunk as it arrives from the transport.
pub type ChunkByteStream = BoxStream<'static, Result<Vec<u8>>>;

// ============================================================================
// Repository ports
// ============================================================================

/// Durable queue of client-authored commits.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Insert one commit with status `pending`. Generates ids when absent.
    async fn enqueue(
        &self,
        operations: Vec<Operation>,
        client_commit_id: Option<String>,
    ) -> Result<EnqueueReceipt>;

    /// Atomically claim the oldest dispatchable commit.
    ///
    /// Transitions exactly one candidate from `pending` (or stale `sending`)
    /// to `sending` via a compare-and-swap on the observed pre-state. Two
    /// racing claimers never both receive the same commit.
    async fn claim_next(&self) -> Result<Option<OutboxCommit>>;

    /// Record a server acknowledgement.
    async fn mark_acked(&self, id: &str, commit_seq: i64, response: Value) -> Result<()>;

    /// Record a terminal rejection.
    async fn mark_failed(&self, id: &str, error: &str, response: Option<Value>) -> Result<()>;

    /// Return a commit to `pending` (not yet sent, or retriable rejection).
    async fn mark_pending(
        &self,
        id: &str,
        error: Option<&str>,
        response: Option<Value>,
    ) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<OutboxCommit>>;

    /// All commits, oldest first, optionally filtered by status.
    async fn list(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxCommit>>;

    async fn count(&self, status: OutboxStatus) -> Result<i64>;

    /// Number of commits still awaiting dispatch (`pending` + `sending`).
    async fn pending_count(&self) -> Result<i64>;

    /// Delete terminal commits. Cascades conflict rows for deleted commits.
    async fn cleanup(&self, target: CleanupTarget) -> Result<u64>;

    /// Delete every commit regardless of status (reset flows).
    async fn delete_all(&self) -> Result<u64>;
}

/// Per-(profile, subscription) replication records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, state_id: &str, subscription_id: &str)
        -> Result<Option<SubscriptionState>>;

    async fn list_for_state(&self, state_id: &str) -> Result<Vec<SubscriptionState>>;

    async fn upsert(&self, state: &SubscriptionState) -> Result<()>;

    async fn delete(&self, state_id: &str, subscription_id: &str) -> Result<bool>;

    async fn delete_for_state(&self, state_id: &str) -> Result<u64>;
}

/// Durable record of server-rejected operations.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Replace all conflict rows for a rejected commit with one row per
    /// non-applied operation result.
    async fn upsert_for_rejected_commit(
        &self,
        commit: &OutboxCommit,
        response: &PushResponse,
    ) -> Result<Vec<ConflictRow>>;

    /// Stamp `resolved_at` once and store the resolution. Resolving an
    /// already-resolved conflict is a no-op; the boolean reports whether
    /// this call performed the transition.
    async fn resolve(
        &self,
        id: &str,
        resolution: &ConflictResolution,
    ) -> Result<(ConflictRow, bool)>;

    async fn get(&self, id: &str) -> Result<Option<ConflictRow>>;

    async fn unresolved(&self) -> Result<Vec<ConflictRow>>;

    async fn unresolved_count(&self) -> Result<i64>;

    async fn delete_for_commit(&self, outbox_commit_id: &str) -> Result<u64>;

    async fn delete_all(&self) -> Result<u64>;
}

/// Application-table migration hook, invoked once on engine start.
///
/// The migration runner itself is application-provided; the engine only
/// guarantees a best-effort push beforehand so unsynced writes survive
/// migrations that reset tables.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn run(&self) -> Result<()>;
}

// ============================================================================
// Transport contract
// ============================================================================

/// User-implemented transport for push/pull synchronisation.
///
/// Implementations handle network communication with the sync server. At
/// least one of [`fetch_snapshot_chunk`](Self::fetch_snapshot_chunk) /
/// [`fetch_snapshot_chunk_stream`](Self::fetch_snapshot_chunk_stream) must
/// be overridden; each default delegates to the other.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Combined push/pull request.
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse>;

    /// Fetch a whole snapshot chunk into memory.
    async fn fetch_snapshot_chunk(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let mut stream = self.fetch_snapshot_chunk_stream(chunk_id).await?;
        let mut bytes = Vec::new();
        while let Some(piece) = stream.next().await {
            bytes.extend_from_slice(&piece?);
        }
        Ok(bytes)
    }

    /// Open a byte stream for a snapshot chunk.
    async fn fetch_snapshot_chunk_stream(&self, chunk_id: &str) -> Result<ChunkByteStream> {
        let bytes = self.fetch_snapshot_chunk(chunk_id).await?;
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }

    /// The realtime half of the transport, when it has one.
    fn realtime(&self) -> Option<Arc<dyn RealtimeTransport>> {
        None
    }
}

/// Callbacks handed to [`RealtimeTransport::connect`].
#[derive(Clone)]
pub struct RealtimeCallbacks {
    pub on_event: Arc<dyn Fn(RealtimeEvent) + Send + Sync>,
    pub on_state_change: Arc<dyn Fn(RealtimeConnectionState) + Send + Sync>,
    pub on_presence: Option<Arc<dyn Fn(PresenceEvent) + Send + Sync>>,
}

/// Persistent bidirectional channel factory.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open the channel. Delivery of events/state changes happens through
    /// the callbacks until the returned session is disconnected.
    async fn connect(
        &self,
        client_id: &str,
        callbacks: RealtimeCallbacks,
    ) -> Result<Box<dyn RealtimeSession>>;
}

/// A live realtime connection.
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    /// Close the channel. Idempotent.
    async fn disconnect(&self);

    /// Push a commit over the channel. `Ok(None)` means the channel does not
    /// support pushes and the caller should fall back to the combined
    /// endpoint.
    async fn push_via_ws(&self, _request: &PushRequest) -> Result<Option<PushResponse>> {
        Ok(None)
    }

    async fn send_presence_join(&self, _scope_key: &str, _metadata: Option<Value>) -> Result<()> {
        Err(TidesyncError::transport("presence not supported by this transport"))
    }

    async fn send_presence_leave(&self, _scope_key: &str) -> Result<()> {
        Err(TidesyncError::transport("presence not supported by this transport"))
    }

    async fn send_presence_update(&self, _scope_key: &str, _metadata: Option<Value>) -> Result<()> {
        Err(TidesyncError::transport("presence not supported by this transport"))
    }
}
