//! In-memory engine state and transport health.

use serde::{Deserialize, Serialize};

use crate::errors::SyncFault;

/// Connection state of the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Which transport path the engine is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Polling,
    Realtime,
}

/// Why the engine is polling while a realtime transport exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackReason {
    Network,
}

/// Engine state projection, emitted with `state:change`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub enabled: bool,
    pub is_syncing: bool,
    pub connection_state: ConnectionState,
    pub transport_mode: TransportMode,
    /// Epoch milliseconds of the last successful cycle.
    pub last_sync_at: Option<i64>,
    pub error: Option<SyncFault>,
    pub pending_count: i64,
    pub retry_count: u32,
    pub is_retrying: bool,
}

impl EngineState {
    /// State of a freshly constructed, not yet started engine.
    pub fn initial(transport_mode: TransportMode) -> Self {
        Self {
            enabled: false,
            is_syncing: false,
            connection_state: ConnectionState::Disconnected,
            transport_mode,
            last_sync_at: None,
            error: None,
            pending_count: 0,
            retry_count: 0,
            is_retrying: false,
        }
    }
}

/// Health of the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealth {
    pub mode: TransportMode,
    pub connected: bool,
    /// Epoch milliseconds.
    pub last_successful_poll_at: Option<i64>,
    /// Epoch milliseconds.
    pub last_realtime_message_at: Option<i64>,
    pub fallback_reason: Option<FallbackReason>,
}

impl TransportHealth {
    pub fn initial(mode: TransportMode) -> Self {
        Self {
            mode,
            connected: false,
            last_successful_poll_at: None,
            last_realtime_message_at: None,
            fallback_reason: None,
        }
    }
}

/// One-call diagnostics surface for debug UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub state: EngineState,
    pub transport_health: TransportHealth,
    pub pending_outbox_commits: i64,
    pub failed_outbox_commits: i64,
    pub unresolved_conflicts: i64,
    pub subscription_cursors: Vec<SubscriptionCursorSummary>,
}

/// Cursor summary per subscription for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCursorSummary {
    pub subscription_id: String,
    pub table: String,
    pub cursor: i64,
    pub bootstrapping: bool,
}
