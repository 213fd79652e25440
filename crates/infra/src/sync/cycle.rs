//! One push-then-pull sync cycle.
//!
//! The cycle claims at most one outbox commit and piggy-backs it on the
//! combined request carrying the pull body, drains the remaining outbox
//! with individual pushes, then applies the pull response and keeps
//! pulling follow-up rounds while the server signals more data. Follow-up
//! cursors carry the server-advertised position forward and never regress.

use std::sync::Arc;

use tidesync_core::{OutboxQueue, RealtimeSession, SyncTransport};
use tidesync_domain::constants::{DEFAULT_MAX_PULL_ROUNDS, DEFAULT_MAX_PUSH_COMMITS};
use tidesync_domain::{
    ConflictRow, PullRequest, PullRequestSubscription, PullResponse, PullSubscription, Result,
    SubscriptionSpec, SubscriptionStatus, SyncRequest, TidesyncError,
};
use tracing::debug;

use super::pull::{ApplySummary, PullEngine, PullLimits};
use super::push::PushEngine;

/// Per-cycle configuration.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub state_id: String,
    pub client_id: String,
    pub max_push_commits: u32,
    pub max_pull_rounds: u32,
    pub limits: PullLimits,
}

impl CycleConfig {
    pub fn new(state_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            state_id: state_id.into(),
            client_id: client_id.into(),
            max_push_commits: DEFAULT_MAX_PUSH_COMMITS,
            max_pull_rounds: DEFAULT_MAX_PULL_ROUNDS,
            limits: PullLimits::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub pushed: usize,
    pub acked: usize,
    pub new_conflicts: Vec<ConflictRow>,
    pub pull_rounds: usize,
    pub pulled_subscriptions: usize,
    pub apply: ApplySummary,
}

/// Run one push-then-pull cycle.
pub async fn run_cycle(
    outbox: &Arc<dyn OutboxQueue>,
    push_engine: &PushEngine,
    pull_engine: &PullEngine,
    transport: &Arc<dyn SyncTransport>,
    realtime: Option<&dyn RealtimeSession>,
    desired: &[SubscriptionSpec],
    config: &CycleConfig,
) -> Result<CycleReport> {
    let mut report = CycleReport::default();

    // Claim at most one commit for the combined request.
    let claimed = outbox.claim_next().await?;
    let push_body = match &claimed {
        Some(commit) => Some(push_engine.prepare_request(commit).await?),
        None => None,
    };

    let pull_body =
        pull_engine.build_pull_request(&config.state_id, desired, &config.limits).await?;

    let envelope = SyncRequest {
        client_id: config.client_id.clone(),
        push: push_body,
        pull: Some(pull_body.clone()),
    };
    let combined = match transport.sync(envelope).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(commit) = &claimed {
                push_engine.return_to_pending(commit, &err).await?;
            }
            return Err(err);
        }
    };

    // Push disposition first: a later commit never starts before this one
    // settled, and the pull apply below observes the post-push world.
    if let Some(commit) = claimed {
        match combined.push {
            Some(response) => {
                let outcome = push_engine.complete(&commit, response).await?;
                report.pushed += 1;
                if outcome.acked {
                    report.acked += 1;
                }
                report.new_conflicts.extend(outcome.new_conflicts);
            }
            None => {
                let err =
                    TidesyncError::transport("combined response is missing the push section");
                push_engine.return_to_pending(&commit, &err).await?;
                return Err(err);
            }
        }
    }

    // Drain whatever else accumulated in the outbox.
    while (report.pushed as u32) < config.max_push_commits {
        let outcome = push_engine.push_once(realtime).await?;
        if !outcome.pushed {
            break;
        }
        report.pushed += 1;
        if outcome.acked {
            report.acked += 1;
        }
        report.new_conflicts.extend(outcome.new_conflicts);
    }

    // Apply rounds. Each round commits in its own transaction; cursor
    // monotonicity makes the rounds composable, and the report merges
    // their summaries per subscription.
    let mut request = pull_body;
    let mut response = combined.pull;
    while let Some(current) = response.take() {
        report.pull_rounds += 1;
        report.pulled_subscriptions = report.pulled_subscriptions.max(current.subscriptions.len());

        let followup = if (report.pull_rounds as u32) < config.max_pull_rounds {
            build_followup_request(&request, &current)
        } else {
            debug!(rounds = report.pull_rounds, "pull round cap reached");
            None
        };

        let summary = pull_engine
            .apply_pull_response(&config.state_id, &request, current, desired)
            .await?;
        report.apply.merge(summary);

        if let Some(next_request) = followup {
            let envelope = SyncRequest {
                client_id: config.client_id.clone(),
                push: None,
                pull: Some(next_request.clone()),
            };
            let next = transport.sync(envelope).await?;
            request = next_request;
            response = next.pull;
        }
    }

    Ok(report)
}

/// Follow-up pull state for subscriptions that signalled more data.
fn build_followup_request(
    request: &PullRequest,
    response: &PullResponse,
) -> Option<PullRequest> {
    let subscriptions: Vec<PullRequestSubscription> = request
        .subscriptions
        .iter()
        .filter_map(|req_sub| {
            let section: &PullSubscription =
                response.subscriptions.iter().find(|s| s.id == req_sub.id)?;
            if section.status != SubscriptionStatus::Active || !section.has_more() {
                return None;
            }
            let mut next = req_sub.clone();
            // Carry the server cursor forward; never regress.
            next.cursor = req_sub.cursor.max(section.next_cursor);
            next.bootstrap_state = section.bootstrap_state.clone();
            Some(next)
        })
        .collect();

    if subscriptions.is_empty() {
        None
    } else {
        Some(PullRequest { subscriptions, ..request.clone() })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tidesync_core::{ConflictStore, SyncPlugin};
    use tidesync_domain::{
        OutboxStatus, Operation, PushResponse, PushStatus, ScopeMap, SnapshotPage, SyncResponse,
    };
    use tokio::sync::Mutex as TokioMutex;

    use super::*;
    use crate::database::manager::test_support;
    use crate::database::schema_handler::{ColumnSpec, SchemaTableHandler, TableSchema};
    use crate::database::handler::TableRegistry;
    use crate::database::{DbManager, SqliteConflictStore, SqliteOutboxRepository};

    struct ScriptedTransport {
        responses: TokioMutex<Vec<Result<SyncResponse>>>,
        requests: TokioMutex<Vec<SyncRequest>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<SyncResponse>>) -> Self {
            Self {
                responses: TokioMutex::new(responses),
                requests: TokioMutex::new(Vec::new()),
            }
        }

        async fn requests(&self) -> Vec<SyncRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
            self.requests.lock().await.push(request);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok(SyncResponse {
                    push: None,
                    pull: Some(PullResponse { ok: true, subscriptions: Vec::new() }),
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn applied(commit_seq: i64) -> PushResponse {
        PushResponse {
            status: PushStatus::Applied,
            commit_seq: Some(commit_seq),
            results: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    fn pull_section(
        bootstrap: bool,
        next_cursor: i64,
        rows: Vec<serde_json::Value>,
    ) -> PullSubscription {
        PullSubscription {
            id: "sub-1".into(),
            status: SubscriptionStatus::Active,
            scopes: Some(ScopeMap::new()),
            bootstrap,
            bootstrap_state: None,
            next_cursor,
            commits: Vec::new(),
            snapshots: if rows.is_empty() {
                Vec::new()
            } else {
                vec![SnapshotPage {
                    table: "items".into(),
                    rows,
                    chunks: None,
                    is_first_page: true,
                    is_last_page: true,
                }]
            },
        }
    }

    struct Fixture {
        db: Arc<DbManager>,
        outbox: Arc<dyn OutboxQueue>,
        push: PushEngine,
        pull: PullEngine,
        transport: Arc<ScriptedTransport>,
        config: CycleConfig,
        _dir: tempfile::TempDir,
    }

    fn fixture(responses: Vec<Result<SyncResponse>>) -> Fixture {
        let (db, dir) = test_support::manager();
        {
            let conn = db.get_connection().unwrap();
            conn.execute_batch(
                "CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT, row_version INTEGER)",
            )
            .unwrap();
        }

        let schema = Arc::new(
            TableSchema::new("items", vec![ColumnSpec::new("name")])
                .with_version_column("row_version"),
        );
        let mut registry = TableRegistry::new();
        registry
            .register("items", Arc::new(SchemaTableHandler::new(schema).unwrap()))
            .unwrap();
        let registry = Arc::new(registry);

        let transport = Arc::new(ScriptedTransport::new(responses));
        let outbox: Arc<dyn OutboxQueue> =
            Arc::new(SqliteOutboxRepository::new(Arc::clone(&db)));
        let conflicts: Arc<dyn ConflictStore> =
            Arc::new(SqliteConflictStore::new(Arc::clone(&db)));
        let plugins: Vec<Arc<dyn SyncPlugin>> = Vec::new();

        let push = PushEngine::new(
            "client-1",
            Arc::clone(&outbox),
            conflicts,
            Arc::clone(&transport) as Arc<dyn SyncTransport>,
            plugins.clone(),
        );
        let pull = PullEngine::new(
            Arc::clone(&db),
            registry,
            Arc::clone(&transport) as Arc<dyn SyncTransport>,
            plugins,
        );

        Fixture {
            db,
            outbox,
            push,
            pull,
            transport,
            config: CycleConfig::new("profile-1", "client-1"),
            _dir: dir,
        }
    }

    fn desired() -> Vec<SubscriptionSpec> {
        vec![SubscriptionSpec::new("sub-1", "items")]
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn combined_cycle_pushes_and_applies_in_one_request() {
        let fx = fixture(vec![Ok(SyncResponse {
            push: Some(applied(7)),
            pull: Some(PullResponse {
                ok: true,
                subscriptions: vec![pull_section(
                    true,
                    7,
                    vec![json!({"id": "1", "name": "A"})],
                )],
            }),
        })]);

        let receipt = fx
            .outbox
            .enqueue(vec![Operation::upsert("items", "1", json!({"name": "A"}))], None)
            .await
            .expect("enqueue");

        let report = run_cycle(
            &fx.outbox,
            &fx.push,
            &fx.pull,
            &(Arc::clone(&fx.transport) as Arc<dyn SyncTransport>),
            None,
            &desired(),
            &fx.config,
        )
        .await
        .expect("cycle");

        assert_eq!(report.pushed, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(report.pull_rounds, 1);
        assert_eq!(report.apply.snapshot_rows, 1);

        // One combined request carried both bodies.
        let requests = fx.transport.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].push.is_some());
        assert!(requests[0].pull.is_some());

        let commit = fx.outbox.get(&receipt.id).await.expect("get").expect("present");
        assert_eq!(commit.status, OutboxStatus::Acked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remaining_commits_drain_after_the_combined_request() {
        let fx = fixture(vec![
            Ok(SyncResponse {
                push: Some(applied(1)),
                pull: Some(PullResponse { ok: true, subscriptions: Vec::new() }),
            }),
            Ok(SyncResponse { push: Some(applied(2)), pull: None }),
        ]);

        fx.outbox
            .enqueue(vec![Operation::upsert("items", "1", json!({"name": "A"}))], None)
            .await
            .expect("enqueue 1");
        fx.outbox
            .enqueue(vec![Operation::upsert("items", "2", json!({"name": "B"}))], None)
            .await
            .expect("enqueue 2");

        let report = run_cycle(
            &fx.outbox,
            &fx.push,
            &fx.pull,
            &(Arc::clone(&fx.transport) as Arc<dyn SyncTransport>),
            None,
            &desired(),
            &fx.config,
        )
        .await
        .expect("cycle");

        assert_eq!(report.pushed, 2);
        assert_eq!(report.acked, 2);
        assert_eq!(fx.outbox.pending_count().await.expect("count"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followup_rounds_continue_while_more_data_is_signalled() {
        let fx = fixture(vec![
            // Round 1: bootstrap with more data.
            Ok(SyncResponse {
                push: None,
                pull: Some(PullResponse {
                    ok: true,
                    subscriptions: vec![pull_section(
                        true,
                        2,
                        vec![json!({"id": "1", "name": "A"})],
                    )],
                }),
            }),
            // Round 2: quiesced.
            Ok(SyncResponse {
                push: None,
                pull: Some(PullResponse {
                    ok: true,
                    subscriptions: vec![pull_section(
                        false,
                        2,
                        Vec::new(),
                    )],
                }),
            }),
        ]);

        let report = run_cycle(
            &fx.outbox,
            &fx.push,
            &fx.pull,
            &(Arc::clone(&fx.transport) as Arc<dyn SyncTransport>),
            None,
            &desired(),
            &fx.config,
        )
        .await
        .expect("cycle");

        assert_eq!(report.pull_rounds, 2);

        let requests = fx.transport.requests().await;
        assert_eq!(requests.len(), 2);
        let followup = requests[1].pull.as_ref().expect("pull body");
        assert_eq!(followup.subscriptions[0].cursor, 2, "cursor carried forward");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_failure_returns_the_piggybacked_commit() {
        let fx = fixture(vec![Err(TidesyncError::transport_status("HTTP 502", 502))]);

        let receipt = fx
            .outbox
            .enqueue(vec![Operation::upsert("items", "1", json!({"name": "A"}))], None)
            .await
            .expect("enqueue");

        let err = run_cycle(
            &fx.outbox,
            &fx.push,
            &fx.pull,
            &(Arc::clone(&fx.transport) as Arc<dyn SyncTransport>),
            None,
            &desired(),
            &fx.config,
        )
        .await
        .expect_err("transport error propagates");
        assert!(matches!(err, TidesyncError::Transport { .. }));

        let commit = fx.outbox.get(&receipt.id).await.expect("get").expect("present");
        assert_eq!(commit.status, OutboxStatus::Pending);

        let _ = &fx.db;
    }
}
