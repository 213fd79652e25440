//! Durable records of server-rejected operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TidesyncError;

/// Whether the server rejected the operation as a version conflict or as a
/// plain error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Conflict,
    Error,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => f.write_str("conflict"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = TidesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(TidesyncError::InvalidInput(format!("unknown conflict status: {other}"))),
        }
    }
}

/// One rejected operation, keyed by outbox commit and operation index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRow {
    pub id: String,
    pub outbox_commit_id: String,
    pub client_commit_id: String,
    pub op_index: i32,
    pub status: ConflictStatus,
    pub message: String,
    pub code: Option<String>,
    pub server_version: Option<i64>,
    pub server_row_json: Option<Value>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; set exactly once.
    pub resolved_at: Option<i64>,
    pub resolution: Option<String>,
}

/// How the application resolved a conflict.
///
/// Resolving never mutates application rows; semantic repair requires a new
/// mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    KeepLocal,
    KeepServer,
    Custom(Value),
}

impl ConflictResolution {
    /// Stored string form: `keep-local`, `keep-server`, or `custom:<json>`.
    pub fn as_storage_string(&self) -> String {
        match self {
            Self::KeepLocal => "keep-local".to_string(),
            Self::KeepServer => "keep-server".to_string(),
            Self::Custom(value) => format!("custom:{value}"),
        }
    }
}
