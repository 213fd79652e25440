//! Domain constants and protocol defaults.

use std::time::Duration;

/// Client schema version stamped on every outbox commit.
pub const CLIENT_SCHEMA_VERSION: i32 = 1;

/// Default number of incremental commits requested per pull.
pub const DEFAULT_LIMIT_COMMITS: u32 = 50;

/// Default number of snapshot rows requested per pull page.
pub const DEFAULT_LIMIT_SNAPSHOT_ROWS: u32 = 1000;

/// Default number of snapshot pages fetched per pull round.
pub const DEFAULT_MAX_SNAPSHOT_PAGES: u32 = 4;

/// Maximum outbox commits drained per sync cycle.
pub const DEFAULT_MAX_PUSH_COMMITS: u32 = 20;

/// Maximum follow-up pull rounds per sync cycle.
pub const DEFAULT_MAX_PULL_ROUNDS: u32 = 20;

/// Rows per `apply_snapshot` batch when streaming chunked snapshots.
pub const SNAPSHOT_BATCH_ROWS: usize = 500;

/// Concurrent chunk fetches when materialising snapshots for plugins.
pub const CHUNK_FETCH_CONCURRENCY: usize = 8;

/// `sending` rows older than this are considered abandoned and reclaimable.
pub const STALE_SENDING_THRESHOLD: Duration = Duration::from_secs(30);

/// Alternative candidates tried when a `claim_next` CAS loses a race.
pub const CLAIM_RACE_RETRIES: u32 = 3;

/// Poll interval in polling transport mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll interval for the fallback poller while realtime is down.
pub const DEFAULT_FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the catch-up sync after a realtime reconnect.
pub const DEFAULT_RECONNECT_CATCHUP_DELAY: Duration = Duration::from_millis(500);

/// Maximum consecutive retryable sync failures before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base delay of the sync retry schedule.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling of the sync retry schedule.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Default `data:change` debounce while idle.
pub const DEFAULT_DATA_CHANGE_DEBOUNCE: Duration = Duration::from_millis(10);

/// Bound on the inspector event ring.
pub const INSPECTOR_CAPACITY: usize = 500;

/// Default timeout for `await_phase` / `await_bootstrap_complete`.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Cursor value meaning "no commit applied yet".
pub const CURSOR_NONE: i64 = -1;

/// Snapshot chunk encoding supported by this client.
pub const CHUNK_ENCODING_JSON_ROW_FRAME_V1: &str = "json-row-frame-v1";
