//! Presence types: ephemeral who-is-here state per scope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One participant within a presence scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub client_id: String,
    pub actor_id: String,
    /// Epoch milliseconds.
    pub joined_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Action of a presence event delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    /// Replace the scope's whole list.
    Snapshot,
    Join,
    Leave,
    Update,
}

/// Presence event as delivered by the realtime transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub scope_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<PresenceEntry>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_event_parses_entries() {
        let raw = serde_json::json!({
            "action": "snapshot",
            "scopeKey": "doc:1",
            "entries": [
                {"clientId": "c1", "actorId": "a1", "joinedAt": 1000},
                {"clientId": "c2", "actorId": "a2", "joinedAt": 2000, "metadata": {"cursor": 4}}
            ]
        });
        let event: PresenceEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.action, PresenceAction::Snapshot);
        assert_eq!(event.entries.as_ref().map(Vec::len), Some(2));
    }
}
