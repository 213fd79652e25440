//! Push engine: dispatches one claimed outbox commit and interprets the
//! server's disposition.
//!
//! Transport failures always return the commit to `pending`; the only path
//! to `failed` is a terminal server rejection. Plugin failures after the
//! server has responded persist the server's disposition before they
//! propagate, so a crashy plugin cannot cause a double send.

use std::sync::Arc;

use serde_json::Value;
use tidesync_core::{
    plugins_ascending, plugins_descending, ConflictStore, OutboxQueue, RealtimeSession,
    SyncPlugin, SyncTransport,
};
use tidesync_domain::{
    ConflictRow, OutboxCommit, PushRequest, PushResponse, PushStatus, Result, SyncRequest,
    TidesyncError,
};
use tracing::{debug, warn};

use super::truncate_reason;

/// Outcome of one push attempt.
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    /// A commit was claimed and dispatched.
    pub pushed: bool,
    /// The dispatched commit was acknowledged (applied or cached).
    pub acked: bool,
    pub commit_id: Option<String>,
    /// Conflicts recorded by a terminal rejection.
    pub new_conflicts: Vec<ConflictRow>,
}

impl PushOutcome {
    fn idle() -> Self {
        Self::default()
    }
}

/// Claims outbox commits and pushes them to the server.
pub struct PushEngine {
    client_id: String,
    outbox: Arc<dyn OutboxQueue>,
    conflicts: Arc<dyn ConflictStore>,
    transport: Arc<dyn SyncTransport>,
    plugins: Vec<Arc<dyn SyncPlugin>>,
}

impl PushEngine {
    pub fn new(
        client_id: impl Into<String>,
        outbox: Arc<dyn OutboxQueue>,
        conflicts: Arc<dyn ConflictStore>,
        transport: Arc<dyn SyncTransport>,
        plugins: Vec<Arc<dyn SyncPlugin>>,
    ) -> Self {
        Self { client_id: client_id.into(), outbox, conflicts, transport, plugins }
    }

    /// Claim and dispatch at most one commit.
    pub async fn push_once(
        &self,
        realtime: Option<&dyn RealtimeSession>,
    ) -> Result<PushOutcome> {
        let Some(commit) = self.outbox.claim_next().await? else {
            return Ok(PushOutcome::idle());
        };
        self.dispatch(commit, realtime).await
    }

    /// Dispatch an already-claimed commit.
    pub async fn dispatch(
        &self,
        commit: OutboxCommit,
        realtime: Option<&dyn RealtimeSession>,
    ) -> Result<PushOutcome> {
        let request = self.prepare_request(&commit).await?;

        // Bidirectional fast path first; `None` means unsupported.
        let ws_response = match realtime {
            Some(session) => match session.push_via_ws(&request).await {
                Ok(response) => response,
                Err(err) => {
                    self.return_to_pending(&commit, &err).await?;
                    return Err(err);
                }
            },
            None => None,
        };

        let response = match ws_response {
            Some(response) => response,
            None => {
                let envelope = SyncRequest {
                    client_id: self.client_id.clone(),
                    push: Some(request),
                    pull: None,
                };
                match self.transport.sync(envelope).await {
                    Ok(combined) => match combined.push {
                        Some(response) => response,
                        None => {
                            let err = TidesyncError::transport(
                                "combined response is missing the push section",
                            );
                            self.return_to_pending(&commit, &err).await?;
                            return Err(err);
                        }
                    },
                    Err(err) => {
                        self.return_to_pending(&commit, &err).await?;
                        return Err(err);
                    }
                }
            }
        };

        self.complete(&commit, response).await
    }

    /// Build the push request and run `before_push` plugins (ascending
    /// priority). A plugin failure returns the commit to `pending`.
    pub async fn prepare_request(&self, commit: &OutboxCommit) -> Result<PushRequest> {
        let mut request = PushRequest {
            client_commit_id: commit.client_commit_id.clone(),
            operations: commit.operations.clone(),
            schema_version: commit.schema_version,
        };

        for plugin in plugins_ascending(&self.plugins) {
            if let Err(err) = plugin.before_push(&mut request).await {
                let err =
                    TidesyncError::Plugin(format!("before_push {}: {err}", plugin.name()));
                self.return_to_pending(commit, &err).await?;
                return Err(err);
            }
        }

        Ok(request)
    }

    /// Return a claimed commit to `pending` after a pre-response failure.
    pub async fn return_to_pending(&self, commit: &OutboxCommit, err: &TidesyncError) -> Result<()> {
        warn!(commit_id = %commit.id, error = %err, "push failed before ack, returning to pending");
        self.outbox
            .mark_pending(&commit.id, Some(&truncate_reason(&err.to_string())), None)
            .await
    }

    /// Run `after_push` plugins and persist the server's disposition.
    pub async fn complete(
        &self,
        commit: &OutboxCommit,
        response: PushResponse,
    ) -> Result<PushOutcome> {
        let raw = serde_json::to_value(&response).unwrap_or(Value::Null);

        // `after_push` runs in descending priority. If a plugin fails after
        // the server already responded, the disposition is persisted first
        // and the plugin error propagates afterwards.
        let mut plugin_error = None;
        for plugin in plugins_descending(&self.plugins) {
            if let Err(err) = plugin.after_push(&response).await {
                plugin_error =
                    Some(TidesyncError::Plugin(format!("after_push {}: {err}", plugin.name())));
                break;
            }
        }

        if let Some(err) = plugin_error {
            match response.status {
                PushStatus::Applied | PushStatus::Cached => {
                    self.outbox
                        .mark_acked(&commit.id, response.commit_seq.unwrap_or(0), raw)
                        .await?;
                }
                PushStatus::Rejected => {
                    self.outbox.mark_failed(&commit.id, "REJECTED", Some(raw)).await?;
                }
            }
            return Err(err);
        }

        match response.status {
            PushStatus::Applied | PushStatus::Cached => {
                let commit_seq = response.commit_seq.unwrap_or(0);
                self.outbox.mark_acked(&commit.id, commit_seq, raw).await?;
                debug!(commit_id = %commit.id, commit_seq, "commit acked");
                Ok(PushOutcome {
                    pushed: true,
                    acked: true,
                    commit_id: Some(commit.id.clone()),
                    new_conflicts: Vec::new(),
                })
            }
            PushStatus::Rejected if response.all_errors_retriable() => {
                let message = truncate_reason(&response.failure_message());
                self.outbox.mark_pending(&commit.id, Some(&message), Some(raw)).await?;
                debug!(commit_id = %commit.id, "rejection is retriable, commit back to pending");
                Ok(PushOutcome {
                    pushed: true,
                    acked: false,
                    commit_id: Some(commit.id.clone()),
                    new_conflicts: Vec::new(),
                })
            }
            PushStatus::Rejected => {
                let new_conflicts =
                    self.conflicts.upsert_for_rejected_commit(commit, &response).await?;
                self.outbox.mark_failed(&commit.id, "REJECTED", Some(raw)).await?;
                warn!(
                    commit_id = %commit.id,
                    conflicts = new_conflicts.len(),
                    "commit terminally rejected"
                );
                Ok(PushOutcome {
                    pushed: true,
                    acked: false,
                    commit_id: Some(commit.id.clone()),
                    new_conflicts,
                })
            }
        }
    }
}
