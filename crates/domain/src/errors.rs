//! Error types used throughout the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Tidesync.
///
/// Raised by repositories, engines, and the orchestrator. Errors that cross
/// the engine boundary are classified into a [`SyncFault`] before they are
/// surfaced to the application.
#[derive(Error, Debug)]
pub enum TidesyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status when the transport surfaced one.
        status: Option<u16>,
    },

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Snapshot decode error: {0}")]
    SnapshotDecode(String),

    #[error("Snapshot chunk integrity failure: {0}")]
    ChunkIntegrity(String),

    #[error("Table handler error: {0}")]
    Handler(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Engine lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TidesyncError {
    /// Transport error without an HTTP status (connection refused, DNS, …).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), status: None }
    }

    /// Transport error that carries the server's HTTP status.
    pub fn transport_status(message: impl Into<String>, status: u16) -> Self {
        Self::Transport { message: message.into(), status: Some(status) }
    }
}

/// Result type alias for Tidesync operations.
pub type Result<T> = std::result::Result<T, TidesyncError>;

/// Stable error codes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorCode {
    #[serde(rename = "NETWORK_ERROR")]
    NetworkError,
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "SNAPSHOT_CHUNK_NOT_FOUND")]
    SnapshotChunkNotFound,
    #[serde(rename = "MIGRATION_FAILED")]
    MigrationFailed,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "SYNC_ERROR")]
    SyncError,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl SyncErrorCode {
    /// Wire/display form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SnapshotChunkNotFound => "SNAPSHOT_CHUNK_NOT_FOUND",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::Conflict => "CONFLICT",
            Self::SyncError => "SYNC_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified sync error surfaced to the application.
///
/// Recorded in engine state, emitted with `sync:error`, and kept in the
/// inspector ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFault {
    pub code: SyncErrorCode,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
}

impl SyncFault {
    /// Build a fault with the mandatory fields; context is added with the
    /// `with_*` builders.
    pub fn new(code: SyncErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            timestamp: Utc::now(),
            http_status: None,
            subscription_id: None,
            state_id: None,
        }
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_state(mut self, state_id: impl Into<String>) -> Self {
        self.state_id = Some(state_id.into());
        self
    }
}

impl std::fmt::Display for SyncFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
