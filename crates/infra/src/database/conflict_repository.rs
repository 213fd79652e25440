//! SQLite-backed conflict store.
//!
//! Conflicts are the durable record of server-rejected operations; they are
//! keyed by outbox commit and operation index and replaced wholesale when a
//! commit is rejected again.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Row;
use serde_json::Value;
use tidesync_core::ConflictStore;
use tidesync_domain::{
    ConflictResolution, ConflictRow, ConflictStatus, OpResultStatus, OutboxCommit, PushResponse,
    Result, TidesyncError,
};
use tokio::task;
use tracing::warn;
use uuid::Uuid;

use super::manager::{now_ms, DbManager};
use crate::errors::{map_join_error, map_sql_error};

/// SQLite-backed conflict repository.
pub struct SqliteConflictStore {
    db: Arc<DbManager>,
}

impl SqliteConflictStore {
    /// Construct a store backed by the shared database manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConflictStore for SqliteConflictStore {
    async fn upsert_for_rejected_commit(
        &self,
        commit: &OutboxCommit,
        response: &PushResponse,
    ) -> Result<Vec<ConflictRow>> {
        let db = Arc::clone(&self.db);
        let outbox_commit_id = commit.id.clone();
        let client_commit_id = commit.client_commit_id.clone();
        let response = response.clone();

        task::spawn_blocking(move || -> Result<Vec<ConflictRow>> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;

            // Prior conflicts for this commit are superseded by the new
            // response.
            tx.execute(
                "DELETE FROM conflicts WHERE outbox_commit_id = ?1",
                rusqlite::params![outbox_commit_id],
            )
            .map_err(map_sql_error)?;

            let now = now_ms();
            let mut inserted = Vec::new();
            for result in &response.results {
                let status = match result.status {
                    OpResultStatus::Applied => continue,
                    OpResultStatus::Conflict => ConflictStatus::Conflict,
                    OpResultStatus::Error => ConflictStatus::Error,
                };

                let message = result
                    .message
                    .as_deref()
                    .or(result.error.as_deref())
                    .unwrap_or("operation rejected")
                    .to_string();
                let row = ConflictRow {
                    id: Uuid::new_v4().to_string(),
                    outbox_commit_id: outbox_commit_id.clone(),
                    client_commit_id: client_commit_id.clone(),
                    op_index: result.op_index,
                    status,
                    message,
                    code: result.code.clone(),
                    server_version: result.server_version,
                    server_row_json: result.server_row.clone(),
                    created_at: now,
                    resolved_at: None,
                    resolution: None,
                };

                tx.execute(
                    CONFLICT_INSERT_SQL,
                    rusqlite::params![
                        row.id,
                        row.outbox_commit_id,
                        row.client_commit_id,
                        row.op_index,
                        row.status.to_string(),
                        row.message,
                        row.code,
                        row.server_version,
                        row.server_row_json.as_ref().map(Value::to_string),
                        row.created_at
                    ],
                )
                .map_err(map_sql_error)?;
                inserted.push(row);
            }

            tx.commit().map_err(map_sql_error)?;
            Ok(inserted)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn resolve(
        &self,
        id: &str,
        resolution: &ConflictResolution,
    ) -> Result<(ConflictRow, bool)> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        let resolution = resolution.as_storage_string();

        task::spawn_blocking(move || -> Result<(ConflictRow, bool)> {
            let conn = db.get_connection()?;

            // `resolved_at IS NULL` makes the stamp monotonic: a second
            // resolve matches zero rows and leaves the original intact.
            let updated = conn
                .inner()
                .execute(
                    "UPDATE conflicts SET resolved_at = ?1, resolution = ?2
                     WHERE id = ?3 AND resolved_at IS NULL",
                    rusqlite::params![now_ms(), resolution, id],
                )
                .map_err(map_sql_error)?;

            let row = conn
                .inner()
                .query_row(CONFLICT_SELECT_SQL, rusqlite::params![id], map_conflict_row)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        Err(TidesyncError::NotFound(format!("conflict {id} not found")))
                    }
                    other => Err(map_sql_error(other)),
                })?;

            Ok((row, updated == 1))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, id: &str) -> Result<Option<ConflictRow>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<Option<ConflictRow>> {
            let conn = db.get_connection()?;
            conn.inner()
                .query_row(CONFLICT_SELECT_SQL, rusqlite::params![id], map_conflict_row)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error(other)),
                })
        })
        .await
        .map_err(map_join_error)?
    }

    async fn unresolved(&self) -> Result<Vec<ConflictRow>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<ConflictRow>> {
            let conn = db.get_connection()?;
            let mut stmt = conn
                .inner()
                .prepare(
                    "SELECT id, outbox_commit_id, client_commit_id, op_index, result_status,
                            message, code, server_version, server_row_json, created_at,
                            resolved_at, resolution
                     FROM conflicts
                     WHERE resolved_at IS NULL
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(map_sql_error)?;
            let rows = stmt.query_map([], map_conflict_row).map_err(map_sql_error)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn unresolved_count(&self) -> Result<i64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<i64> {
            let conn = db.get_connection()?;
            conn.inner()
                .query_row(
                    "SELECT COUNT(*) FROM conflicts WHERE resolved_at IS NULL",
                    [],
                    |row| row.get(0),
                )
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete_for_commit(&self, outbox_commit_id: &str) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let outbox_commit_id = outbox_commit_id.to_owned();

        task::spawn_blocking(move || -> Result<u64> {
            let conn = db.get_connection()?;
            let deleted = conn
                .inner()
                .execute(
                    "DELETE FROM conflicts WHERE outbox_commit_id = ?1",
                    rusqlite::params![outbox_commit_id],
                )
                .map_err(map_sql_error)?;
            Ok(deleted as u64)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete_all(&self) -> Result<u64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<u64> {
            let conn = db.get_connection()?;
            let deleted =
                conn.inner().execute("DELETE FROM conflicts", []).map_err(map_sql_error)? as u64;
            Ok(deleted)
        })
        .await
        .map_err(map_join_error)?
    }
}

const CONFLICT_INSERT_SQL: &str = "INSERT INTO conflicts (
        id, outbox_commit_id, client_commit_id, op_index, result_status, message,
        code, server_version, server_row_json, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const CONFLICT_SELECT_SQL: &str = "SELECT
        id, outbox_commit_id, client_commit_id, op_index, result_status, message,
        code, server_version, server_row_json, created_at, resolved_at, resolution
    FROM conflicts
    WHERE id = ?1";

fn map_conflict_row(row: &Row<'_>) -> rusqlite::Result<ConflictRow> {
    let id: String = row.get(0)?;
    let status_raw: String = row.get(4)?;
    let server_row_json: Option<String> = row.get(8)?;

    let status = status_raw.parse::<ConflictStatus>().unwrap_or_else(|err| {
        warn!(conflict_id = %id, raw_status = %status_raw, error = %err,
            "invalid conflict status in store, defaulting to error");
        ConflictStatus::Error
    });

    Ok(ConflictRow {
        id,
        outbox_commit_id: row.get(1)?,
        client_commit_id: row.get(2)?,
        op_index: row.get(3)?,
        status,
        message: row.get(5)?,
        code: row.get(6)?,
        server_version: row.get(7)?,
        server_row_json: server_row_json.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
        resolution: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidesync_domain::{OpResult, Operation, OutboxStatus, PushStatus};

    use super::*;
    use crate::database::manager::test_support;

    fn rejected_commit() -> OutboxCommit {
        OutboxCommit {
            id: "commit-1".into(),
            client_commit_id: "ccid-1".into(),
            status: OutboxStatus::Sending,
            operations: vec![
                Operation::upsert("items", "row-1", json!({"name": "A"})),
                Operation::upsert("items", "row-2", json!({"name": "B"})),
            ],
            last_response: None,
            error: None,
            created_at: 1_000,
            updated_at: 1_000,
            attempt_count: 1,
            acked_commit_seq: None,
            schema_version: 1,
        }
    }

    fn rejected_response() -> PushResponse {
        PushResponse {
            status: PushStatus::Rejected,
            commit_seq: None,
            results: vec![
                OpResult {
                    op_index: 0,
                    status: OpResultStatus::Applied,
                    message: None,
                    server_version: None,
                    server_row: None,
                    error: None,
                    code: None,
                    retriable: None,
                },
                OpResult {
                    op_index: 1,
                    status: OpResultStatus::Conflict,
                    message: Some("version mismatch".into()),
                    server_version: Some(9),
                    server_row: Some(json!({"id": "row-2", "name": "Server"})),
                    error: None,
                    code: None,
                    retriable: None,
                },
            ],
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_non_applied_results_become_conflicts() {
        let (db, _dir) = test_support::manager();
        let store = SqliteConflictStore::new(Arc::clone(&db));

        let rows = store
            .upsert_for_rejected_commit(&rejected_commit(), &rejected_response())
            .await
            .expect("upsert");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op_index, 1);
        assert_eq!(rows[0].status, ConflictStatus::Conflict);
        assert_eq!(rows[0].server_version, Some(9));
        assert_eq!(store.unresolved_count().await.expect("count"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reupserting_replaces_prior_rows() {
        let (db, _dir) = test_support::manager();
        let store = SqliteConflictStore::new(Arc::clone(&db));

        store
            .upsert_for_rejected_commit(&rejected_commit(), &rejected_response())
            .await
            .expect("first upsert");
        let rows = store
            .upsert_for_rejected_commit(&rejected_commit(), &rejected_response())
            .await
            .expect("second upsert");

        assert_eq!(rows.len(), 1);
        assert_eq!(store.unresolved_count().await.expect("count"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_is_monotonic_and_idempotent() {
        let (db, _dir) = test_support::manager();
        let store = SqliteConflictStore::new(Arc::clone(&db));

        let rows = store
            .upsert_for_rejected_commit(&rejected_commit(), &rejected_response())
            .await
            .expect("upsert");
        let id = rows[0].id.clone();

        let (resolved, changed) =
            store.resolve(&id, &ConflictResolution::KeepLocal).await.expect("resolve");
        assert!(changed);
        let first_stamp = resolved.resolved_at.expect("stamped");
        assert_eq!(resolved.resolution.as_deref(), Some("keep-local"));

        let (again, changed) =
            store.resolve(&id, &ConflictResolution::KeepServer).await.expect("re-resolve");
        assert!(!changed, "second resolve must be a no-op");
        assert_eq!(again.resolved_at, Some(first_stamp));
        assert_eq!(again.resolution.as_deref(), Some("keep-local"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_unknown_conflict_fails() {
        let (db, _dir) = test_support::manager();
        let store = SqliteConflictStore::new(Arc::clone(&db));

        let result = store.resolve("missing", &ConflictResolution::KeepLocal).await;
        assert!(matches!(result, Err(TidesyncError::NotFound(_))));
    }
}
