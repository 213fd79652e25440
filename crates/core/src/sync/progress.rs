//! Progress projection: derives channel and per-subscription phases from
//! engine state, stored subscription rows, and in-flight bootstrap
//! tracking.

use std::collections::HashMap;

use tidesync_domain::constants::CURSOR_NONE;
use tidesync_domain::{
    ChannelPhase, EngineState, SubscriptionPhase, SubscriptionProgress, SubscriptionState,
    SyncProgress,
};

/// Tables processed / tables total for a bootstrap currently streaming.
pub type BootstrapsInFlight = HashMap<String, (usize, usize)>;

/// Compute the progress projection.
///
/// Phase precedence: `error` beats everything while the engine is enabled;
/// a bootstrap in any subscription reports `bootstrapping`; an active sync
/// before the first completed cycle is `starting`, afterwards
/// `catching_up`; an idle engine with a completed cycle is `live`.
pub fn project_progress(
    state: &EngineState,
    subscriptions: &[SubscriptionState],
    bootstraps_in_flight: &BootstrapsInFlight,
) -> SyncProgress {
    let subscriptions: Vec<SubscriptionProgress> = subscriptions
        .iter()
        .map(|sub| project_subscription(state, sub, bootstraps_in_flight))
        .collect();

    let channel_phase = if !state.enabled {
        ChannelPhase::Idle
    } else if state.error.is_some() {
        ChannelPhase::Error
    } else if subscriptions.iter().any(|s| s.phase == SubscriptionPhase::Bootstrapping) {
        ChannelPhase::Bootstrapping
    } else if state.last_sync_at.is_none() {
        ChannelPhase::Starting
    } else if state.is_syncing {
        ChannelPhase::CatchingUp
    } else {
        ChannelPhase::Live
    };

    SyncProgress { channel_phase, subscriptions }
}

fn project_subscription(
    state: &EngineState,
    sub: &SubscriptionState,
    bootstraps_in_flight: &BootstrapsInFlight,
) -> SubscriptionProgress {
    let in_flight = bootstraps_in_flight.get(&sub.subscription_id).copied();

    let (phase, processed, total) = if let Some((processed, total)) = in_flight {
        (SubscriptionPhase::Bootstrapping, Some(processed), Some(total))
    } else if let Some(bootstrap) = &sub.bootstrap_state {
        (
            SubscriptionPhase::Bootstrapping,
            Some(bootstrap.table_index),
            Some(bootstrap.tables.len()),
        )
    } else if sub.cursor == CURSOR_NONE {
        (SubscriptionPhase::Pending, None, None)
    } else if state.is_syncing {
        (SubscriptionPhase::CatchingUp, None, None)
    } else {
        (SubscriptionPhase::Live, None, None)
    };

    SubscriptionProgress {
        subscription_id: sub.subscription_id.clone(),
        table: sub.table.clone(),
        phase,
        tables_processed: processed,
        tables_total: total,
    }
}
