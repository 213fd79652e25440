//! SQLite-backed implementation of the outbox queue port.
//!
//! The outbox is the only coordination point between processes sharing one
//! store: `claim_next` transitions a candidate to `sending` with a
//! compare-and-swap on the observed pre-state, so two racing claimers never
//! dispatch the same commit twice.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Row, ToSql, Transaction};
use serde_json::Value;
use tidesync_core::OutboxQueue;
use tidesync_domain::constants::{CLAIM_RACE_RETRIES, CLIENT_SCHEMA_VERSION, STALE_SENDING_THRESHOLD};
use tidesync_domain::{
    CleanupTarget, EnqueueReceipt, Operation, OutboxCommit, OutboxStatus, Result, TidesyncError,
};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use super::manager::{now_ms, DbManager};
use crate::errors::{map_join_error, map_sql_error};

/// SQLite-backed outbox repository.
pub struct SqliteOutboxRepository {
    db: Arc<DbManager>,
}

impl SqliteOutboxRepository {
    /// Construct a repository backed by the shared database manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn claim_next_blocking(conn: &rusqlite::Connection) -> Result<Option<OutboxCommit>> {
        let now = now_ms();
        let stale_before = now - STALE_SENDING_THRESHOLD.as_millis() as i64;

        for attempt in 0..=CLAIM_RACE_RETRIES {
            let candidate: Option<(String, String, i64)> = conn
                .query_row(
                    OUTBOX_CANDIDATE_SQL,
                    rusqlite::params![stale_before],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error(other)),
                })?;

            let Some((id, observed_status, observed_updated_at)) = candidate else {
                return Ok(None);
            };

            // CAS: the observed pre-state is part of the predicate, so a
            // concurrent claimer invalidates this update rather than racing
            // it.
            let updated = conn
                .execute(
                    OUTBOX_CLAIM_SQL,
                    rusqlite::params![now, id, observed_status, observed_updated_at],
                )
                .map_err(map_sql_error)?;

            if updated == 1 {
                let commit = conn
                    .query_row(OUTBOX_SELECT_SQL, rusqlite::params![id], map_outbox_row)
                    .map_err(map_sql_error)?;
                return Ok(Some(commit));
            }

            debug!(commit_id = %id, attempt, "lost outbox claim race, retrying");
        }

        Ok(None)
    }

    fn transition_blocking(
        conn: &rusqlite::Connection,
        id: &str,
        status: OutboxStatus,
        error: Option<&str>,
        response: Option<&Value>,
        acked_commit_seq: Option<i64>,
    ) -> Result<()> {
        let response_json = response.map(Value::to_string);
        let updated = conn
            .execute(
                OUTBOX_TRANSITION_SQL,
                rusqlite::params![
                    status.to_string(),
                    error,
                    response_json,
                    acked_commit_seq,
                    now_ms(),
                    id
                ],
            )
            .map_err(map_sql_error)?;

        if updated == 0 {
            Err(TidesyncError::NotFound(format!("outbox commit {id} not found")))
        } else {
            Ok(())
        }
    }
}

/// Insert a fresh `pending` commit inside an existing transaction.
///
/// Used by the mutation recorder so application rows and the outbox row
/// commit atomically.
pub(crate) fn insert_in_tx(
    tx: &Transaction<'_>,
    operations: &[Operation],
    client_commit_id: Option<String>,
) -> Result<EnqueueReceipt> {
    let id = Uuid::new_v4().to_string();
    let client_commit_id = client_commit_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let operations_json = serde_json::to_string(operations)
        .map_err(|e| TidesyncError::Internal(format!("serialising operations: {e}")))?;
    let now = now_ms();

    tx.execute(
        OUTBOX_INSERT_SQL,
        rusqlite::params![
            id,
            client_commit_id,
            OutboxStatus::Pending.to_string(),
            operations_json,
            now,
            now,
            CLIENT_SCHEMA_VERSION
        ],
    )
    .map_err(map_sql_error)?;

    Ok(EnqueueReceipt { id, client_commit_id })
}

#[async_trait]
impl OutboxQueue for SqliteOutboxRepository {
    async fn enqueue(
        &self,
        operations: Vec<Operation>,
        client_commit_id: Option<String>,
    ) -> Result<EnqueueReceipt> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<EnqueueReceipt> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let receipt = insert_in_tx(&tx, &operations, client_commit_id)?;
            tx.commit().map_err(map_sql_error)?;
            Ok(receipt)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn claim_next(&self) -> Result<Option<OutboxCommit>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Option<OutboxCommit>> {
            let conn = db.get_connection()?;
            Self::claim_next_blocking(conn.inner())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_acked(&self, id: &str, commit_seq: i64, response: Value) -> Result<()> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::transition_blocking(
                conn.inner(),
                &id,
                OutboxStatus::Acked,
                None,
                Some(&response),
                Some(commit_seq),
            )
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_failed(&self, id: &str, error: &str, response: Option<Value>) -> Result<()> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        let error = error.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::transition_blocking(
                conn.inner(),
                &id,
                OutboxStatus::Failed,
                Some(&error),
                response.as_ref(),
                None,
            )
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_pending(
        &self,
        id: &str,
        error: Option<&str>,
        response: Option<Value>,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        let error = error.map(str::to_owned);

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::transition_blocking(
                conn.inner(),
                &id,
                OutboxStatus::Pending,
                error.as_deref(),
                response.as_ref(),
                None,
            )
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxCommit>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<Option<OutboxCommit>> {
            let conn = db.get_connection()?;
            conn.inner()
                .query_row(OUTBOX_SELECT_SQL, rusqlite::params![id], map_outbox_row)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error(other)),
                })
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxCommit>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<OutboxCommit>> {
            let conn = db.get_connection()?;
            let inner = conn.inner();
            let collect = |sql: &str, params: &[&dyn ToSql]| -> Result<Vec<OutboxCommit>> {
                let mut stmt = inner.prepare(sql).map_err(map_sql_error)?;
                let rows = stmt.query_map(params, map_outbox_row).map_err(map_sql_error)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(map_sql_error)
            };

            match status {
                Some(status) => {
                    let status = status.to_string();
                    collect(OUTBOX_LIST_BY_STATUS_SQL, &[&status])
                }
                None => collect(OUTBOX_LIST_SQL, &[]),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn count(&self, status: OutboxStatus) -> Result<i64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<i64> {
            let conn = db.get_connection()?;
            conn.inner()
                .query_row(
                    "SELECT COUNT(*) FROM outbox_commits WHERE status = ?1",
                    rusqlite::params![status.to_string()],
                    |row| row.get(0),
                )
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn pending_count(&self) -> Result<i64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<i64> {
            let conn = db.get_connection()?;
            conn.inner()
                .query_row(OUTBOX_PENDING_COUNT_SQL, [], |row| row.get(0))
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn cleanup(&self, target: CleanupTarget) -> Result<u64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<u64> {
            let statuses: &[OutboxStatus] = match target {
                CleanupTarget::Acked => &[OutboxStatus::Acked],
                CleanupTarget::Failed => &[OutboxStatus::Failed],
                CleanupTarget::All => &[OutboxStatus::Acked, OutboxStatus::Failed],
            };

            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let mut deleted = 0u64;
            for status in statuses {
                let status = status.to_string();
                // Conflict rows cascade with their commit.
                tx.execute(
                    "DELETE FROM conflicts WHERE outbox_commit_id IN
                     (SELECT id FROM outbox_commits WHERE status = ?1)",
                    rusqlite::params![status],
                )
                .map_err(map_sql_error)?;
                deleted += tx
                    .execute(
                        "DELETE FROM outbox_commits WHERE status = ?1",
                        rusqlite::params![status],
                    )
                    .map_err(map_sql_error)? as u64;
            }
            tx.commit().map_err(map_sql_error)?;
            Ok(deleted)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete_all(&self) -> Result<u64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<u64> {
            let conn = db.get_connection()?;
            let deleted = conn
                .inner()
                .execute("DELETE FROM outbox_commits", [])
                .map_err(map_sql_error)? as u64;
            Ok(deleted)
        })
        .await
        .map_err(map_join_error)?
    }
}

const OUTBOX_INSERT_SQL: &str = "INSERT INTO outbox_commits (
        id, client_commit_id, status, operations_json, created_at, updated_at, schema_version
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const OUTBOX_CANDIDATE_SQL: &str = "SELECT id, status, updated_at
    FROM outbox_commits
    WHERE status = 'pending'
       OR (status = 'sending' AND updated_at <= ?1)
    ORDER BY created_at ASC, id ASC
    LIMIT 1";

const OUTBOX_CLAIM_SQL: &str = "UPDATE outbox_commits
    SET status = 'sending',
        attempt_count = attempt_count + 1,
        updated_at = ?1,
        error = NULL,
        last_response_json = NULL
    WHERE id = ?2 AND status = ?3 AND updated_at = ?4";

const OUTBOX_TRANSITION_SQL: &str = "UPDATE outbox_commits
    SET status = ?1,
        error = ?2,
        last_response_json = ?3,
        acked_commit_seq = COALESCE(?4, acked_commit_seq),
        updated_at = ?5
    WHERE id = ?6";

const OUTBOX_SELECT_SQL: &str = "SELECT
        id, client_commit_id, status, operations_json, last_response_json, error,
        created_at, updated_at, attempt_count, acked_commit_seq, schema_version
    FROM outbox_commits
    WHERE id = ?1";

const OUTBOX_LIST_SQL: &str = "SELECT
        id, client_commit_id, status, operations_json, last_response_json, error,
        created_at, updated_at, attempt_count, acked_commit_seq, schema_version
    FROM outbox_commits
    ORDER BY created_at ASC, id ASC";

const OUTBOX_LIST_BY_STATUS_SQL: &str = "SELECT
        id, client_commit_id, status, operations_json, last_response_json, error,
        created_at, updated_at, attempt_count, acked_commit_seq, schema_version
    FROM outbox_commits
    WHERE status = ?1
    ORDER BY created_at ASC, id ASC";

const OUTBOX_PENDING_COUNT_SQL: &str =
    "SELECT COUNT(*) FROM outbox_commits WHERE status IN ('pending', 'sending')";

fn map_outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxCommit> {
    let id: String = row.get(0)?;
    let status_raw: String = row.get(2)?;
    let operations_json: String = row.get(3)?;
    let response_json: Option<String> = row.get(4)?;

    let status = status_raw.parse::<OutboxStatus>().unwrap_or_else(|err| {
        warn!(
            commit_id = %id,
            raw_status = %status_raw,
            error = %err,
            "invalid outbox status in store, defaulting to pending"
        );
        OutboxStatus::Pending
    });

    let operations: Vec<Operation> = serde_json::from_str(&operations_json).unwrap_or_else(|err| {
        warn!(commit_id = %id, error = %err, "invalid operations payload in store");
        Vec::new()
    });

    let last_response =
        response_json.and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

    Ok(OutboxCommit {
        id,
        client_commit_id: row.get(1)?,
        status,
        operations,
        last_response,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        attempt_count: row.get(8)?,
        acked_commit_seq: row.get(9)?,
        schema_version: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::database::manager::test_support;

    fn ops() -> Vec<Operation> {
        vec![Operation::upsert("items", "row-1", json!({"name": "A"}))]
    }

    async fn repo() -> (Arc<SqliteOutboxRepository>, Arc<DbManager>, tempfile::TempDir) {
        let (db, dir) = test_support::manager();
        (Arc::new(SqliteOutboxRepository::new(Arc::clone(&db))), db, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_then_claim_round_trips_operations() {
        let (repo, _db, _dir) = repo().await;

        let receipt = repo.enqueue(ops(), Some("ccid-1".into())).await.expect("enqueue");
        assert_eq!(receipt.client_commit_id, "ccid-1");

        let claimed = repo.claim_next().await.expect("claim").expect("commit available");
        assert_eq!(claimed.id, receipt.id);
        assert_eq!(claimed.status, OutboxStatus::Sending);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.operations, ops());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_client_commit_ids_are_rejected() {
        let (repo, _db, _dir) = repo().await;

        repo.enqueue(ops(), Some("ccid-1".into())).await.expect("first enqueue");
        let result = repo.enqueue(ops(), Some("ccid-1".into())).await;
        assert!(result.is_err(), "unique clientCommitId must be enforced");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claims_oldest_first_and_skips_fresh_sending() {
        let (repo, db, _dir) = repo().await;

        let first = repo.enqueue(ops(), None).await.expect("enqueue 1");
        // Force distinct created_at ordering.
        {
            let conn = db.get_connection().expect("conn");
            conn.execute(
                "UPDATE outbox_commits SET created_at = created_at - 1000 WHERE id = ?1",
                &[&first.id as &dyn ToSql],
            )
            .expect("backdate");
        }
        let second = repo.enqueue(ops(), None).await.expect("enqueue 2");

        let claimed = repo.claim_next().await.expect("claim").expect("commit");
        assert_eq!(claimed.id, first.id, "oldest commit claims first");

        // First is now fresh `sending`; the next claim takes the second.
        let claimed = repo.claim_next().await.expect("claim").expect("commit");
        assert_eq!(claimed.id, second.id);

        // Nothing claimable remains.
        assert!(repo.claim_next().await.expect("claim").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_sending_commits_are_reclaimable() {
        let (repo, db, _dir) = repo().await;

        let receipt = repo.enqueue(ops(), None).await.expect("enqueue");
        let claimed = repo.claim_next().await.expect("claim").expect("commit");
        assert_eq!(claimed.id, receipt.id);

        // Fresh `sending` is not claimable.
        assert!(repo.claim_next().await.expect("claim").is_none());

        // Age the claim past the stale threshold.
        {
            let conn = db.get_connection().expect("conn");
            conn.execute(
                "UPDATE outbox_commits SET updated_at = updated_at - 31000 WHERE id = ?1",
                &[&receipt.id as &dyn ToSql],
            )
            .expect("age");
        }

        let reclaimed = repo.claim_next().await.expect("claim").expect("commit");
        assert_eq!(reclaimed.id, receipt.id);
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_claimers_never_share_a_commit() {
        let (repo, _db, _dir) = repo().await;

        for _ in 0..8 {
            repo.enqueue(ops(), None).await.expect("enqueue");
        }

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(commit) = repo.claim_next().await.expect("claim") {
                    claimed.push(commit.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.expect("join"));
        }

        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(unique.len(), all.len(), "a commit was dispatched twice");
        assert_eq!(all.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transitions_update_status_and_bookkeeping() {
        let (repo, _db, _dir) = repo().await;

        let receipt = repo.enqueue(ops(), None).await.expect("enqueue");
        let claimed = repo.claim_next().await.expect("claim").expect("commit");

        repo.mark_acked(&claimed.id, 41, json!({"status": "applied"}))
            .await
            .expect("mark_acked");

        let commit = repo.get(&receipt.id).await.expect("get").expect("present");
        assert_eq!(commit.status, OutboxStatus::Acked);
        assert_eq!(commit.acked_commit_seq, Some(41));
        assert_eq!(commit.last_response, Some(json!({"status": "applied"})));
        assert!(commit.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retriable_rejection_returns_to_pending() {
        let (repo, _db, _dir) = repo().await;

        let receipt = repo.enqueue(ops(), None).await.expect("enqueue");
        repo.claim_next().await.expect("claim").expect("commit");
        repo.mark_pending(&receipt.id, Some("server busy"), None).await.expect("mark_pending");

        let commit = repo.get(&receipt.id).await.expect("get").expect("present");
        assert_eq!(commit.status, OutboxStatus::Pending);
        assert_eq!(commit.error.as_deref(), Some("server busy"));

        // And it is claimable again.
        let reclaimed = repo.claim_next().await.expect("claim").expect("commit");
        assert_eq!(reclaimed.id, receipt.id);
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_count_includes_sending() {
        let (repo, _db, _dir) = repo().await;

        repo.enqueue(ops(), None).await.expect("enqueue 1");
        repo.enqueue(ops(), None).await.expect("enqueue 2");
        repo.claim_next().await.expect("claim").expect("commit");

        assert_eq!(repo.pending_count().await.expect("count"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_cascades_conflicts() {
        let (repo, db, _dir) = repo().await;

        let receipt = repo.enqueue(ops(), None).await.expect("enqueue");
        let claimed = repo.claim_next().await.expect("claim").expect("commit");
        repo.mark_failed(&claimed.id, "REJECTED", None).await.expect("mark_failed");

        {
            let conn = db.get_connection().expect("conn");
            conn.execute(
                "INSERT INTO conflicts (id, outbox_commit_id, client_commit_id, op_index,
                    result_status, message, created_at)
                 VALUES ('c1', ?1, ?2, 0, 'conflict', 'version mismatch', 0)",
                &[&receipt.id as &dyn ToSql, &receipt.client_commit_id],
            )
            .expect("seed conflict");
        }

        let deleted = repo.cleanup(CleanupTarget::Failed).await.expect("cleanup");
        assert_eq!(deleted, 1);

        let conn = db.get_connection().expect("conn");
        let conflicts: i64 =
            conn.query_row("SELECT COUNT(*) FROM conflicts", &[], |row| row.get(0)).unwrap();
        assert_eq!(conflicts, 0);
    }
}
