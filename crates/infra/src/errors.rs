//! Infrastructure error mapping.

use thiserror::Error;
use tidesync_common::storage::StorageError;
use tidesync_domain::TidesyncError;

/// Infrastructure-level error wrapper.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Task join error: {0}")]
    Join(String),
}

impl From<InfraError> for TidesyncError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Join(msg) => Self::Internal(msg),
            other => Self::Database(other.to_string()),
        }
    }
}

/// Map a storage error into the domain error type.
pub(crate) fn map_storage_error(err: StorageError) -> TidesyncError {
    TidesyncError::from(InfraError::from(err))
}

/// Map a raw rusqlite error into the domain error type.
pub(crate) fn map_sql_error(err: rusqlite::Error) -> TidesyncError {
    TidesyncError::from(InfraError::from(err))
}

/// Map a tokio join error into the domain error type.
pub(crate) fn map_join_error(err: tokio::task::JoinError) -> TidesyncError {
    if err.is_cancelled() {
        TidesyncError::Internal("blocking task cancelled".into())
    } else {
        TidesyncError::Internal(format!("blocking task panic: {err}"))
    }
}
