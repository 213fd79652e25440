//! SQLite-backed subscription state store.
//!
//! Besides the async port implementation, this module exposes
//! transaction-scoped helpers used by the pull engine so cursor and
//! bootstrap-state updates commit atomically with row-data application.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Row, Transaction};
use tidesync_core::SubscriptionStore;
use tidesync_domain::{
    BootstrapState, Result, ScopeMap, SubscriptionState, SubscriptionStatus, TidesyncError,
};
use tokio::task;
use tracing::warn;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_sql_error};

/// SQLite-backed subscription store.
pub struct SqliteSubscriptionStore {
    db: Arc<DbManager>,
}

impl SqliteSubscriptionStore {
    /// Construct a store backed by the shared database manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn get(
        &self,
        state_id: &str,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionState>> {
        let db = Arc::clone(&self.db);
        let state_id = state_id.to_owned();
        let subscription_id = subscription_id.to_owned();

        task::spawn_blocking(move || -> Result<Option<SubscriptionState>> {
            let conn = db.get_connection()?;
            get_row(conn.inner(), &state_id, &subscription_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_for_state(&self, state_id: &str) -> Result<Vec<SubscriptionState>> {
        let db = Arc::clone(&self.db);
        let state_id = state_id.to_owned();

        task::spawn_blocking(move || -> Result<Vec<SubscriptionState>> {
            let conn = db.get_connection()?;
            list_rows(conn.inner(), &state_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn upsert(&self, state: &SubscriptionState) -> Result<()> {
        let db = Arc::clone(&self.db);
        let state = state.clone();

        task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            upsert_in_tx(&tx, &state)?;
            tx.commit().map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete(&self, state_id: &str, subscription_id: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let state_id = state_id.to_owned();
        let subscription_id = subscription_id.to_owned();

        task::spawn_blocking(move || -> Result<bool> {
            let conn = db.get_connection()?;
            let deleted = conn
                .inner()
                .execute(
                    "DELETE FROM subscription_state WHERE state_id = ?1 AND subscription_id = ?2",
                    rusqlite::params![state_id, subscription_id],
                )
                .map_err(map_sql_error)?;
            Ok(deleted > 0)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete_for_state(&self, state_id: &str) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let state_id = state_id.to_owned();

        task::spawn_blocking(move || -> Result<u64> {
            let conn = db.get_connection()?;
            let deleted = conn
                .inner()
                .execute(
                    "DELETE FROM subscription_state WHERE state_id = ?1",
                    rusqlite::params![state_id],
                )
                .map_err(map_sql_error)?;
            Ok(deleted as u64)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// Transaction-scoped helpers (pull apply, ws inline apply, reset)
// ============================================================================

const SELECT_COLUMNS: &str = "state_id, subscription_id, table_name, scopes_json, params_json,
    cursor, bootstrap_state_json, status, created_at, updated_at";

/// Read one row inside a transaction (or any connection-like handle).
pub(crate) fn get_row(
    conn: &rusqlite::Connection,
    state_id: &str,
    subscription_id: &str,
) -> Result<Option<SubscriptionState>> {
    conn.query_row(
        &format!(
            "SELECT {SELECT_COLUMNS} FROM subscription_state
             WHERE state_id = ?1 AND subscription_id = ?2"
        ),
        rusqlite::params![state_id, subscription_id],
        map_subscription_row,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(map_sql_error(other)),
    })
}

/// All rows for a profile, oldest update first.
pub(crate) fn list_rows(
    conn: &rusqlite::Connection,
    state_id: &str,
) -> Result<Vec<SubscriptionState>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscription_state
             WHERE state_id = ?1
             ORDER BY updated_at ASC, subscription_id ASC"
        ))
        .map_err(map_sql_error)?;
    let rows = stmt
        .query_map(rusqlite::params![state_id], map_subscription_row)
        .map_err(map_sql_error)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(map_sql_error)
}

/// Every row in the store, across all profiles (reset `all` scope).
pub(crate) fn list_all_rows(conn: &rusqlite::Connection) -> Result<Vec<SubscriptionState>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscription_state
             ORDER BY state_id ASC, subscription_id ASC"
        ))
        .map_err(map_sql_error)?;
    let rows = stmt.query_map([], map_subscription_row).map_err(map_sql_error)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(map_sql_error)
}

/// Cursor of one row, `None` when the row does not exist.
pub(crate) fn read_cursor(
    conn: &rusqlite::Connection,
    state_id: &str,
    subscription_id: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT cursor FROM subscription_state
         WHERE state_id = ?1 AND subscription_id = ?2",
        rusqlite::params![state_id, subscription_id],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(map_sql_error(other)),
    })
}

/// Insert-or-replace one row inside the caller's transaction.
pub(crate) fn upsert_in_tx(tx: &Transaction<'_>, state: &SubscriptionState) -> Result<()> {
    let scopes_json = serde_json::to_string(&state.scopes)
        .map_err(|e| TidesyncError::Internal(format!("serialising scopes: {e}")))?;
    let params_json = state
        .params
        .as_ref()
        .map(|p| {
            serde_json::to_string(p)
                .map_err(|e| TidesyncError::Internal(format!("serialising params: {e}")))
        })
        .transpose()?;
    let bootstrap_json = state
        .bootstrap_state
        .as_ref()
        .map(|b| {
            serde_json::to_string(b)
                .map_err(|e| TidesyncError::Internal(format!("serialising bootstrap state: {e}")))
        })
        .transpose()?;

    tx.execute(
        "INSERT INTO subscription_state (
            state_id, subscription_id, table_name, scopes_json, params_json,
            cursor, bootstrap_state_json, status, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (state_id, subscription_id) DO UPDATE SET
            table_name = excluded.table_name,
            scopes_json = excluded.scopes_json,
            params_json = excluded.params_json,
            cursor = excluded.cursor,
            bootstrap_state_json = excluded.bootstrap_state_json,
            status = excluded.status,
            updated_at = excluded.updated_at",
        rusqlite::params![
            state.state_id,
            state.subscription_id,
            state.table,
            scopes_json,
            params_json,
            state.cursor,
            bootstrap_json,
            state.status.to_string(),
            state.created_at,
            state.updated_at
        ],
    )
    .map_err(map_sql_error)?;
    Ok(())
}

/// Delete one row inside the caller's transaction.
pub(crate) fn delete_in_tx(
    tx: &Transaction<'_>,
    state_id: &str,
    subscription_id: &str,
) -> Result<bool> {
    let deleted = tx
        .execute(
            "DELETE FROM subscription_state WHERE state_id = ?1 AND subscription_id = ?2",
            rusqlite::params![state_id, subscription_id],
        )
        .map_err(map_sql_error)?;
    Ok(deleted > 0)
}

fn map_subscription_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionState> {
    let state_id: String = row.get(0)?;
    let subscription_id: String = row.get(1)?;
    let scopes_json: String = row.get(3)?;
    let params_json: Option<String> = row.get(4)?;
    let bootstrap_json: Option<String> = row.get(6)?;
    let status_raw: String = row.get(7)?;

    let scopes: ScopeMap = serde_json::from_str(&scopes_json).unwrap_or_else(|err| {
        warn!(%state_id, %subscription_id, error = %err, "invalid scopes payload in store");
        ScopeMap::new()
    });
    let params = params_json.and_then(|raw| serde_json::from_str(&raw).ok());
    let bootstrap_state: Option<BootstrapState> =
        bootstrap_json.and_then(|raw| serde_json::from_str(&raw).ok());
    let status = status_raw.parse::<SubscriptionStatus>().unwrap_or_else(|err| {
        warn!(%state_id, %subscription_id, error = %err, "invalid subscription status in store");
        SubscriptionStatus::Active
    });

    Ok(SubscriptionState {
        state_id,
        subscription_id,
        table: row.get(2)?,
        scopes,
        params,
        cursor: row.get(5)?,
        bootstrap_state,
        status,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
