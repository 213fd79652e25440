//! Error classification.
//!
//! Maps raised errors onto the stable `SyncErrorCode` taxonomy and decides
//! retryability. HTTP statuses win over message sniffing; the message rules
//! exist for transports that cannot surface a status.

use tidesync_domain::{SyncErrorCode, SyncFault, TidesyncError};

/// Classify an error raised during a sync cycle.
pub fn classify_error(error: &TidesyncError) -> SyncFault {
    match error {
        TidesyncError::Transport { message, status: Some(status) } => {
            classify_http(*status, message)
        }
        TidesyncError::Transport { message, status: None } => classify_message(message),
        TidesyncError::Migration(message) => {
            SyncFault::new(SyncErrorCode::MigrationFailed, message.clone(), false)
        }
        TidesyncError::ChunkIntegrity(message) => {
            // The server may re-chunk on retry, but the cycle that observed
            // the mismatch is over.
            SyncFault::new(SyncErrorCode::SyncError, message.clone(), false)
        }
        other => classify_message(&other.to_string()),
    }
}

fn classify_http(status: u16, message: &str) -> SyncFault {
    let lower = message.to_lowercase();
    let (code, retryable) = match status {
        401 | 403 => (SyncErrorCode::AuthFailed, false),
        404 if lower.contains("snapshot") && lower.contains("chunk") => {
            (SyncErrorCode::SnapshotChunkNotFound, false)
        }
        408 | 429 => (SyncErrorCode::NetworkError, true),
        s if s >= 500 => (SyncErrorCode::NetworkError, true),
        _ => (SyncErrorCode::SyncError, false),
    };
    SyncFault::new(code, message, retryable).with_http_status(status)
}

fn classify_message(message: &str) -> SyncFault {
    let lower = message.to_lowercase();
    if ["network", "fetch", "timeout", "offline"].iter().any(|n| lower.contains(n)) {
        return SyncFault::new(SyncErrorCode::NetworkError, message, true);
    }
    if lower.contains("conflict") {
        return SyncFault::new(SyncErrorCode::Conflict, message, false);
    }
    SyncFault::new(SyncErrorCode::SyncError, message, false)
}
