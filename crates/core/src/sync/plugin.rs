//! Sync plugin contract and ordering rules.
//!
//! Plugins are sorted ascending by numeric priority (default 50).
//! `before_push` and `after_pull` run low-to-high; `after_push` runs
//! high-to-low. Sorting is stable, so equal priorities keep registration
//! order.

use std::sync::Arc;

use async_trait::async_trait;
use tidesync_domain::{Operation, PullResponse, PushRequest, PushResponse, Result};

/// Default plugin priority.
pub const DEFAULT_PLUGIN_PRIORITY: i32 = 50;

/// Application-provided hook into the sync pipeline.
#[async_trait]
pub trait SyncPlugin: Send + Sync {
    /// Stable name used in logs and error messages.
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_PLUGIN_PRIORITY
    }

    /// Transform a push request before it is sent. A failure returns the
    /// claimed commit to `pending`.
    async fn before_push(&self, _request: &mut PushRequest) -> Result<()> {
        Ok(())
    }

    /// Observe a push response. Failures propagate only after the server's
    /// disposition has been persisted.
    async fn after_push(&self, _response: &PushResponse) -> Result<()> {
        Ok(())
    }

    /// Whether this plugin transforms pull responses. When any registered
    /// plugin returns true, chunked snapshots are materialised before apply
    /// and realtime inline deliveries are routed through a full sync.
    fn wants_after_pull(&self) -> bool {
        false
    }

    /// Transform a pull response before it is applied.
    async fn after_pull(&self, _response: &mut PullResponse) -> Result<()> {
        Ok(())
    }

    /// Transform locally recorded operations before they are written.
    async fn before_apply_local_mutations(&self, _operations: &mut Vec<Operation>) -> Result<()> {
        Ok(())
    }
}

/// Plugins in ascending priority order.
pub fn plugins_ascending(plugins: &[Arc<dyn SyncPlugin>]) -> Vec<Arc<dyn SyncPlugin>> {
    let mut sorted = plugins.to_vec();
    sorted.sort_by_key(|p| p.priority());
    sorted
}

/// Plugins in descending priority order (for `after_push`).
pub fn plugins_descending(plugins: &[Arc<dyn SyncPlugin>]) -> Vec<Arc<dyn SyncPlugin>> {
    let mut sorted = plugins.to_vec();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    sorted
}

/// Whether any plugin transforms pull responses.
pub fn wants_after_pull(plugins: &[Arc<dyn SyncPlugin>]) -> bool {
    plugins.iter().any(|p| p.wants_after_pull())
}
