//! Mutation recorder: the local-then-server write path.
//!
//! One transaction writes the application rows and enqueues the matching
//! outbox commit, so a crash can never leave a local write without its
//! replication record (or vice versa). Optimistic-concurrency guards are
//! captured from the row's version column inside the same transaction when
//! the caller did not supply them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tidesync_domain::constants::CLIENT_SCHEMA_VERSION;
use tidesync_domain::{
    EnqueueReceipt, OpKind, Operation, PushRequest, Result, TidesyncError,
};
use tokio::task;
use tracing::debug;
use uuid::Uuid;

use super::manager::DbManager;
use super::outbox_repository::insert_in_tx;
use super::schema_handler::SchemaTableHandler;
use crate::errors::{map_join_error, map_sql_error};

/// Options for recording a local commit.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// Idempotency id; generated when absent.
    pub client_commit_id: Option<String>,
    /// Skip the automatic base-version read for operations that did not
    /// supply one.
    pub skip_base_version_capture: bool,
}

/// Result of a recorded local commit.
#[derive(Debug, Clone)]
pub struct LocalCommitOutcome {
    pub receipt: EnqueueReceipt,
    /// `(table, row_id)` pairs touched by the commit.
    pub affected: Vec<(String, String)>,
}

/// Records application mutations locally and into the outbox atomically.
pub struct MutationRecorder {
    db: Arc<DbManager>,
    handlers: HashMap<String, Arc<SchemaTableHandler>>,
}

impl MutationRecorder {
    pub fn new(db: Arc<DbManager>, handlers: HashMap<String, Arc<SchemaTableHandler>>) -> Self {
        Self { db, handlers }
    }

    /// Write application rows and the outbox commit in one transaction.
    pub async fn record_local_commit(
        &self,
        operations: Vec<Operation>,
        options: MutationOptions,
    ) -> Result<LocalCommitOutcome> {
        if operations.is_empty() {
            return Err(TidesyncError::InvalidInput("commit carries no operations".into()));
        }
        for op in &operations {
            if !self.handlers.contains_key(&op.table) {
                return Err(TidesyncError::InvalidInput(format!(
                    "no schema registered for table {:?}",
                    op.table
                )));
            }
        }

        let db = Arc::clone(&self.db);
        let handlers = self.handlers.clone();

        task::spawn_blocking(move || -> Result<LocalCommitOutcome> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;

            let mut enriched = operations;
            let mut affected = Vec::with_capacity(enriched.len());
            for op in &mut enriched {
                let handler = handlers
                    .get(&op.table)
                    .ok_or_else(|| {
                        TidesyncError::InvalidInput(format!("no schema for table {:?}", op.table))
                    })?;

                if op.base_version.is_none() && !options.skip_base_version_capture {
                    op.base_version = handler.read_row_version(&tx, &op.row_id)?;
                }

                match op.op {
                    OpKind::Upsert => {
                        let payload = op.payload.as_ref().ok_or_else(|| {
                            TidesyncError::InvalidInput(format!(
                                "upsert of {}/{} carries no payload",
                                op.table, op.row_id
                            ))
                        })?;
                        let row = payload_with_id(payload, handler, &op.row_id)?;
                        handler.upsert_row(&tx, &row, None)?;
                    }
                    OpKind::Delete => handler.delete_row(&tx, &op.row_id)?,
                }
                affected.push((op.table.clone(), op.row_id.clone()));
            }

            let receipt = insert_in_tx(&tx, &enriched, options.client_commit_id)?;
            tx.commit().map_err(map_sql_error)?;

            debug!(
                commit_id = %receipt.id,
                operations = affected.len(),
                "recorded local commit"
            );

            Ok(LocalCommitOutcome { receipt, affected })
        })
        .await
        .map_err(map_join_error)?
    }

    /// Build the request for the outbox-free direct-push path.
    pub fn build_direct_push(
        operations: Vec<Operation>,
        client_commit_id: Option<String>,
    ) -> PushRequest {
        PushRequest {
            client_commit_id: client_commit_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            operations,
            schema_version: CLIENT_SCHEMA_VERSION,
        }
    }
}

/// Ensure the stored row carries the operation's row id.
fn payload_with_id(
    payload: &Value,
    handler: &SchemaTableHandler,
    row_id: &str,
) -> Result<Value> {
    let mut row = payload.clone();
    let Some(object) = row.as_object_mut() else {
        return Err(TidesyncError::InvalidInput("operation payload is not a JSON object".into()));
    };
    object
        .entry(handler.schema().id_column.clone())
        .or_insert_with(|| Value::String(row_id.to_string()));
    Ok(row)
}
