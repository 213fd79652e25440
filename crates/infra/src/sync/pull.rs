//! Pull engine: builds pull requests from subscription state and applies
//! pull responses inside one local transaction.
//!
//! Snapshot apply, incremental-commit apply, cursor advance, bootstrap
//! progress, and revocation cleanup all commit atomically; a failure in any
//! handler rolls the whole response back and leaves cursors untouched.
//!
//! Chunked snapshots stream: per chunk, an async forwarding task (started
//! on demand, so chunks of one snapshot stay sequential) feeds a bounded
//! byte channel that the blocking transaction thread consumes through a
//! `Read` adapter. When any `after_pull` plugin is registered, chunks are
//! instead materialised up front with bounded concurrency so plugins see
//! inline rows.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tidesync_core::{
    decode_chunk, plugins_ascending, wants_after_pull, SnapshotBatcher, SyncPlugin,
    SyncTransport,
};
use tidesync_domain::constants::{
    CHUNK_ENCODING_JSON_ROW_FRAME_V1, CHUNK_FETCH_CONCURRENCY, CURSOR_NONE,
    DEFAULT_LIMIT_COMMITS, DEFAULT_LIMIT_SNAPSHOT_ROWS, DEFAULT_MAX_SNAPSHOT_PAGES,
    SNAPSHOT_BATCH_ROWS,
};
use tidesync_domain::{
    BootstrapProgress, ChunkDescriptor, CommitEntry, PullRequest, PullRequestSubscription,
    PullResponse, PullSubscription, Result, SubscriptionSpec, SubscriptionState,
    SubscriptionStatus, TidesyncError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{debug, warn};

use crate::database::handler::{ApplyContext, SnapshotBatch, TableHandler, TableRegistry};
use crate::database::manager::{now_ms, DbManager};
use crate::database::subscription_repository as subs;
use crate::errors::{map_join_error, map_sql_error};

/// Wire limits carried on every pull request.
#[derive(Debug, Clone)]
pub struct PullLimits {
    pub limit_commits: u32,
    pub limit_snapshot_rows: u32,
    pub max_snapshot_pages: u32,
    pub dedupe_rows: Option<bool>,
}

impl Default for PullLimits {
    fn default() -> Self {
        Self {
            limit_commits: DEFAULT_LIMIT_COMMITS,
            limit_snapshot_rows: DEFAULT_LIMIT_SNAPSHOT_ROWS,
            max_snapshot_pages: DEFAULT_MAX_SNAPSHOT_PAGES,
            dedupe_rows: None,
        }
    }
}

/// What one applied pull response changed locally.
#[derive(Debug, Clone, Default)]
pub struct ApplySummary {
    pub applied_subscriptions: usize,
    /// `(table, row_id)` pairs touched by incremental changes.
    pub row_changes: Vec<(String, String)>,
    /// Tables bootstrapped in bulk (fingerprinted at table level).
    pub bulk_tables: Vec<String>,
    /// Tables cleared by revocation or subscription removal.
    pub cleared_tables: Vec<String>,
    /// `(subscription_id, new_cursor)` for every advanced cursor.
    pub cursor_moves: Vec<(String, i64)>,
    pub bootstrap_events: Vec<BootstrapProgress>,
    pub snapshot_rows: usize,
}

impl ApplySummary {
    /// Fold another round's summary into this one.
    pub fn merge(&mut self, other: ApplySummary) {
        self.applied_subscriptions += other.applied_subscriptions;
        self.row_changes.extend(other.row_changes);
        self.bulk_tables.extend(other.bulk_tables);
        self.cleared_tables.extend(other.cleared_tables);
        self.cursor_moves.extend(other.cursor_moves);
        self.bootstrap_events.extend(other.bootstrap_events);
        self.snapshot_rows += other.snapshot_rows;
    }

    /// Deduplicated list of tables with any local change.
    pub fn changed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .row_changes
            .iter()
            .map(|(table, _)| table.clone())
            .chain(self.bulk_tables.iter().cloned())
            .chain(self.cleared_tables.iter().cloned())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }
}

/// Per-chunk plumbing for the streaming path.
struct StreamedChunk {
    trigger: oneshot::Sender<()>,
    bytes: mpsc::Receiver<Result<Vec<u8>>>,
    sha256: Option<String>,
}

type ChunkKey = (usize, usize, usize);

/// Builds pull requests and applies pull responses.
pub struct PullEngine {
    db: Arc<DbManager>,
    registry: Arc<TableRegistry>,
    transport: Arc<dyn SyncTransport>,
    plugins: Vec<Arc<dyn SyncPlugin>>,
}

impl PullEngine {
    pub fn new(
        db: Arc<DbManager>,
        registry: Arc<TableRegistry>,
        transport: Arc<dyn SyncTransport>,
        plugins: Vec<Arc<dyn SyncPlugin>>,
    ) -> Self {
        Self { db, registry, transport, plugins }
    }

    /// Build a pull request from the stored subscription rows and the
    /// desired subscription set.
    pub async fn build_pull_request(
        &self,
        state_id: &str,
        desired: &[SubscriptionSpec],
        limits: &PullLimits,
    ) -> Result<PullRequest> {
        let db = Arc::clone(&self.db);
        let state_id = state_id.to_owned();
        let stored = task::spawn_blocking(move || -> Result<Vec<SubscriptionState>> {
            let conn = db.get_connection()?;
            subs::list_rows(conn.inner(), &state_id)
        })
        .await
        .map_err(map_join_error)??;

        let by_id: HashMap<&str, &SubscriptionState> =
            stored.iter().map(|s| (s.subscription_id.as_str(), s)).collect();

        let subscriptions = desired
            .iter()
            .map(|spec| {
                let row = by_id.get(spec.id.as_str());
                PullRequestSubscription {
                    id: spec.id.clone(),
                    table: spec.table.clone(),
                    scopes: spec.scopes.clone(),
                    params: spec.params.clone(),
                    cursor: row.map_or(CURSOR_NONE, |r| r.cursor.max(CURSOR_NONE)),
                    bootstrap_state: row.and_then(|r| r.bootstrap_state.clone()),
                }
            })
            .collect();

        Ok(PullRequest {
            limit_commits: limits.limit_commits,
            limit_snapshot_rows: limits.limit_snapshot_rows,
            max_snapshot_pages: limits.max_snapshot_pages,
            dedupe_rows: limits.dedupe_rows,
            subscriptions,
        })
    }

    /// Apply one pull response: one transaction for row data, cursors,
    /// bootstrap state, and revocation cleanup.
    pub async fn apply_pull_response(
        &self,
        state_id: &str,
        request: &PullRequest,
        response: PullResponse,
        desired: &[SubscriptionSpec],
    ) -> Result<ApplySummary> {
        let mut response = response;
        if !response.ok {
            return Err(TidesyncError::transport("pull response reported ok=false"));
        }

        let streamed = if wants_after_pull(&self.plugins) {
            // Plugins observe inline rows, so chunks materialise first.
            self.materialize_chunks(&mut response).await?;
            for plugin in plugins_ascending(&self.plugins) {
                plugin.after_pull(&mut response).await.map_err(|err| {
                    TidesyncError::Plugin(format!("after_pull {}: {err}", plugin.name()))
                })?;
            }
            HashMap::new()
        } else {
            self.spawn_chunk_streams(&response)?
        };

        let db = Arc::clone(&self.db);
        let registry = Arc::clone(&self.registry);
        let state_id = state_id.to_owned();
        let desired = desired.to_vec();
        let request_cursors: HashMap<String, i64> = request
            .subscriptions
            .iter()
            .map(|s| (s.id.clone(), s.cursor))
            .collect();

        task::spawn_blocking(move || {
            apply_blocking(&db, &registry, &state_id, &desired, &request_cursors, &response, streamed)
        })
        .await
        .map_err(map_join_error)?
    }

    /// Replace chunk descriptors with inline rows, fetching with bounded
    /// concurrency. Integrity is verified per chunk as it downloads.
    async fn materialize_chunks(&self, response: &mut PullResponse) -> Result<()> {
        for section in &mut response.subscriptions {
            for page in &mut section.snapshots {
                let Some(chunks) = page.chunks.take() else { continue };
                if chunks.is_empty() {
                    continue;
                }
                for chunk in &chunks {
                    validate_chunk_encoding(chunk)?;
                }

                let fetches = chunks.into_iter().map(|chunk| {
                    let transport = Arc::clone(&self.transport);
                    async move {
                        let bytes = transport.fetch_snapshot_chunk(&chunk.id).await?;
                        let mut rows = Vec::new();
                        decode_chunk(bytes.as_slice(), chunk.sha256.as_deref(), |row| {
                            rows.push(row);
                            Ok(())
                        })?;
                        Ok::<Vec<Value>, TidesyncError>(rows)
                    }
                });

                // `buffered` preserves chunk order while fetching ahead.
                let results: Vec<Result<Vec<Value>>> = futures::stream::iter(fetches)
                    .buffered(CHUNK_FETCH_CONCURRENCY)
                    .collect()
                    .await;
                for rows in results {
                    page.rows.extend(rows?);
                }
            }
        }
        Ok(())
    }

    /// Start one forwarding task per chunk. Tasks stay parked until the
    /// blocking side triggers them, so chunks stream sequentially with
    /// channel-bounded lookahead.
    fn spawn_chunk_streams(
        &self,
        response: &PullResponse,
    ) -> Result<HashMap<ChunkKey, StreamedChunk>> {
        let mut streamed = HashMap::new();

        for (sub_index, section) in response.subscriptions.iter().enumerate() {
            for (page_index, page) in section.snapshots.iter().enumerate() {
                let Some(chunks) = &page.chunks else { continue };
                for (chunk_index, chunk) in chunks.iter().enumerate() {
                    validate_chunk_encoding(chunk)?;

                    let (trigger_tx, trigger_rx) = oneshot::channel::<()>();
                    let (byte_tx, byte_rx) = mpsc::channel::<Result<Vec<u8>>>(8);
                    let transport = Arc::clone(&self.transport);
                    let chunk_id = chunk.id.clone();

                    task::spawn(async move {
                        if trigger_rx.await.is_err() {
                            // Apply never reached this chunk (rollback or
                            // stale skip); nothing to fetch.
                            return;
                        }
                        match transport.fetch_snapshot_chunk_stream(&chunk_id).await {
                            Ok(mut stream) => {
                                while let Some(piece) = stream.next().await {
                                    let failed = piece.is_err();
                                    if byte_tx.send(piece).await.is_err() || failed {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                let _ = byte_tx.send(Err(err)).await;
                            }
                        }
                    });

                    streamed.insert(
                        (sub_index, page_index, chunk_index),
                        StreamedChunk {
                            trigger: trigger_tx,
                            bytes: byte_rx,
                            sha256: chunk.sha256.clone(),
                        },
                    );
                }
            }
        }

        Ok(streamed)
    }
}

fn validate_chunk_encoding(chunk: &ChunkDescriptor) -> Result<()> {
    if chunk.encoding != CHUNK_ENCODING_JSON_ROW_FRAME_V1 {
        return Err(TidesyncError::SnapshotDecode(format!(
            "unsupported chunk encoding {:?} for chunk {}",
            chunk.encoding, chunk.id
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_blocking(
    db: &Arc<DbManager>,
    registry: &Arc<TableRegistry>,
    state_id: &str,
    desired: &[SubscriptionSpec],
    request_cursors: &HashMap<String, i64>,
    response: &PullResponse,
    mut streamed: HashMap<ChunkKey, StreamedChunk>,
) -> Result<ApplySummary> {
    let mut conn = db.get_connection()?;
    let tx = conn.transaction().map_err(map_sql_error)?;
    let mut summary = ApplySummary::default();
    let now = now_ms();

    // Subscriptions known locally but no longer desired: clear their rows
    // and drop the record.
    let desired_ids: HashSet<&str> = desired.iter().map(|s| s.id.as_str()).collect();
    for stored in subs::list_rows(&tx, state_id)? {
        if desired_ids.contains(stored.subscription_id.as_str()) {
            continue;
        }
        if registry.contains(&stored.table) {
            registry.get(&stored.table)?.clear_all(&tx, &stored.scopes)?;
            summary.cleared_tables.push(stored.table.clone());
        }
        subs::delete_in_tx(&tx, state_id, &stored.subscription_id)?;
    }

    for (sub_index, section) in response.subscriptions.iter().enumerate() {
        let Some(spec) = desired.iter().find(|s| s.id == section.id) else {
            debug!(subscription_id = %section.id, "response for undesired subscription, ignoring");
            continue;
        };

        let prev = request_cursors.get(&section.id).copied().unwrap_or(CURSOR_NONE);
        // Re-read inside the transaction to guard against concurrent
        // writers advancing the cursor since the request was built.
        let latest = subs::read_cursor(&tx, state_id, &section.id)?.unwrap_or(CURSOR_NONE);
        let effective = prev.max(latest);

        if section.status == SubscriptionStatus::Revoked {
            let scopes = section.scopes.as_ref().unwrap_or(&spec.scopes);
            registry.get(&spec.table)?.clear_all(&tx, scopes)?;
            subs::delete_in_tx(&tx, state_id, &section.id)?;
            summary.cleared_tables.push(spec.table.clone());
            continue;
        }

        if !section.bootstrap && section.next_cursor < effective {
            debug!(
                subscription_id = %section.id,
                next_cursor = section.next_cursor,
                effective,
                "out-of-order pull response, skipping subscription"
            );
            continue;
        }

        let handler = registry.get(&spec.table)?;
        let rows_before = summary.snapshot_rows;

        if section.bootstrap {
            apply_snapshots(&tx, handler.as_ref(), spec, section, sub_index, &mut streamed, &mut summary)?;
            summary.bulk_tables.push(spec.table.clone());
        } else {
            apply_commits(&tx, registry, section, &mut summary)?;
        }

        // Cursor and bootstrap state advance atomically with the row data.
        let stored = subs::get_row(&tx, state_id, &section.id)?;
        let new_cursor = effective.max(section.next_cursor);
        let row = SubscriptionState {
            state_id: state_id.to_owned(),
            subscription_id: section.id.clone(),
            table: spec.table.clone(),
            scopes: section.scopes.clone().unwrap_or_else(|| spec.scopes.clone()),
            params: spec.params.clone(),
            cursor: new_cursor,
            bootstrap_state: section.bootstrap_state.clone(),
            status: SubscriptionStatus::Active,
            created_at: stored.as_ref().map_or(now, |s| s.created_at),
            updated_at: now,
        };
        subs::upsert_in_tx(&tx, &row)?;
        summary.cursor_moves.push((section.id.clone(), new_cursor));
        summary.applied_subscriptions += 1;

        if section.bootstrap {
            let (processed, total, done) = match &section.bootstrap_state {
                Some(bootstrap) => (bootstrap.table_index, bootstrap.tables.len(), false),
                None => (1, 1, true),
            };
            summary.bootstrap_events.push(BootstrapProgress {
                subscription_id: section.id.clone(),
                table: spec.table.clone(),
                rows_applied: summary.snapshot_rows - rows_before,
                tables_processed: processed,
                tables_total: total,
                done,
            });
        }
    }

    tx.commit().map_err(map_sql_error)?;
    Ok(summary)
}

fn apply_commits(
    tx: &rusqlite::Transaction<'_>,
    registry: &TableRegistry,
    section: &PullSubscription,
    summary: &mut ApplySummary,
) -> Result<()> {
    // Cursor-ascending order; changes within a commit keep list order.
    let mut ordered: Vec<&CommitEntry> = section.commits.iter().collect();
    ordered.sort_by_key(|c| c.commit_seq);

    for commit in ordered {
        let ctx = ApplyContext {
            commit_seq: Some(commit.commit_seq),
            actor_id: commit.actor_id.clone(),
            created_at: commit.created_at.clone(),
        };
        for change in &commit.changes {
            registry.get(&change.table)?.apply_change(tx, &ctx, change)?;
            summary.row_changes.push((change.table.clone(), change.row_id.clone()));
        }
    }
    Ok(())
}

fn apply_snapshots(
    tx: &rusqlite::Transaction<'_>,
    handler: &dyn TableHandler,
    spec: &SubscriptionSpec,
    section: &PullSubscription,
    sub_index: usize,
    streamed: &mut HashMap<ChunkKey, StreamedChunk>,
    summary: &mut ApplySummary,
) -> Result<()> {
    let scopes = &spec.scopes;

    for (page_index, page) in section.snapshots.iter().enumerate() {
        if page.is_first_page {
            handler.on_snapshot_start(tx, scopes)?;
        }

        match &page.chunks {
            Some(chunks) if !chunks.is_empty() => {
                // One batcher spans every chunk of the page, so page flags
                // land on exactly one first and one last batch.
                let mut batcher = SnapshotBatcher::new(SNAPSHOT_BATCH_ROWS);
                let mut emitted_any = false;

                for chunk_index in 0..chunks.len() {
                    let chunk = streamed
                        .remove(&(sub_index, page_index, chunk_index))
                        .ok_or_else(|| {
                            TidesyncError::Internal(format!(
                                "no stream prepared for chunk {}/{}/{}",
                                sub_index, page_index, chunk_index
                            ))
                        })?;
                    let StreamedChunk { trigger, bytes, sha256 } = chunk;
                    // Start the fetch now; earlier chunks are already done.
                    let _ = trigger.send(());
                    let reader = ChannelReader::new(bytes);

                    decode_chunk(reader, sha256.as_deref(), |row| {
                        if let Some(batch) = batcher.push(row) {
                            let is_first = page.is_first_page && !emitted_any;
                            emitted_any = true;
                            handler.apply_snapshot(
                                tx,
                                scopes,
                                &SnapshotBatch {
                                    rows: &batch,
                                    is_first_page: is_first,
                                    is_last_page: false,
                                },
                            )?;
                            summary.snapshot_rows += batch.len();
                        }
                        Ok(())
                    })?;
                }

                let last = batcher.finish();
                let is_first = page.is_first_page && !emitted_any;
                handler.apply_snapshot(
                    tx,
                    scopes,
                    &SnapshotBatch {
                        rows: &last,
                        is_first_page: is_first,
                        is_last_page: page.is_last_page,
                    },
                )?;
                summary.snapshot_rows += last.len();
            }
            _ => {
                handler.apply_snapshot(
                    tx,
                    scopes,
                    &SnapshotBatch {
                        rows: &page.rows,
                        is_first_page: page.is_first_page,
                        is_last_page: page.is_last_page,
                    },
                )?;
                summary.snapshot_rows += page.rows.len();
            }
        }

        if page.is_last_page {
            handler.on_snapshot_end(tx, scopes)?;
        }
    }

    Ok(())
}

/// Blocking `Read` over the chunk byte channel.
struct ChannelReader {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Result<Vec<u8>>>) -> Self {
        Self { rx, buf: Vec::new(), pos: 0 }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.buf = bytes;
                    self.pos = 0;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "chunk stream failed mid-transfer");
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()));
                }
                None => return Ok(0),
            }
        }

        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
