//! Replication progress projection.

use serde::{Deserialize, Serialize};

/// Derived global replication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Idle,
    Starting,
    Bootstrapping,
    CatchingUp,
    Live,
    Error,
}

/// Derived per-subscription replication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPhase {
    Pending,
    Bootstrapping,
    CatchingUp,
    Live,
    Error,
}

/// Progress of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionProgress {
    pub subscription_id: String,
    pub table: String,
    pub phase: SubscriptionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables_total: Option<usize>,
}

/// Whole-channel progress projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub channel_phase: ChannelPhase,
    pub subscriptions: Vec<SubscriptionProgress>,
}

/// Payload of a `bootstrap:progress` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapProgress {
    pub subscription_id: String,
    pub table: String,
    pub rows_applied: usize,
    pub tables_processed: usize,
    pub tables_total: usize,
    pub done: bool,
}
