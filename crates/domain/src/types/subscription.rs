//! Subscription state: the per-(profile, subscription) replication record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::CURSOR_NONE;
use crate::errors::TidesyncError;

/// A scope value: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for ScopeValue {
    fn from(s: &str) -> Self {
        Self::One(s.to_string())
    }
}

/// Scope map attached to a subscription (e.g. `{"workspace_id": "w1"}`).
///
/// Ordered so serialized forms and derived scope keys are deterministic.
pub type ScopeMap = BTreeMap<String, ScopeValue>;

/// Subscription server-side status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Revoked,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Revoked => f.write_str("revoked"),
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = TidesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            other => {
                Err(TidesyncError::InvalidInput(format!("unknown subscription status: {other}")))
            }
        }
    }
}

/// Progress marker for a paginated bootstrap that is mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapState {
    pub as_of_commit_seq: i64,
    pub tables: Vec<String>,
    pub table_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_cursor: Option<String>,
}

/// Durable per-(profile, subscription) replication record.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    /// Profile id ("stateId" on the wire).
    pub state_id: String,
    pub subscription_id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub params: Option<Value>,
    /// Server commit-sequence of the last applied commit, −1 if none.
    pub cursor: i64,
    pub bootstrap_state: Option<BootstrapState>,
    pub status: SubscriptionStatus,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

/// A desired subscription, as declared by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub params: Option<Value>,
}

impl SubscriptionSpec {
    pub fn new(id: impl Into<String>, table: impl Into<String>) -> Self {
        Self { id: id.into(), table: table.into(), scopes: ScopeMap::new(), params: None }
    }

    pub fn with_scope(mut self, key: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        self.scopes.insert(key.into(), value.into());
        self
    }
}

impl SubscriptionState {
    /// Fresh local record for a desired subscription, cursor at −1.
    pub fn for_spec(state_id: impl Into<String>, spec: &SubscriptionSpec, now_ms: i64) -> Self {
        Self {
            state_id: state_id.into(),
            subscription_id: spec.id.clone(),
            table: spec.table.clone(),
            scopes: spec.scopes.clone(),
            params: spec.params.clone(),
            cursor: CURSOR_NONE,
            bootstrap_state: None,
            status: SubscriptionStatus::Active,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_values_serialize_untagged() {
        let mut scopes = ScopeMap::new();
        scopes.insert("workspace".into(), ScopeValue::One("w1".into()));
        scopes.insert("teams".into(), ScopeValue::Many(vec!["a".into(), "b".into()]));

        let json = serde_json::to_value(&scopes).unwrap();
        assert_eq!(json["workspace"], "w1");
        assert_eq!(json["teams"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn bootstrap_state_round_trips() {
        let state = BootstrapState {
            as_of_commit_seq: 42,
            tables: vec!["items".into(), "labels".into()],
            table_index: 1,
            row_cursor: Some("row-99".into()),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["asOfCommitSeq"], 42);
        assert_eq!(json["tableIndex"], 1);

        let back: BootstrapState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn fresh_state_starts_before_any_cursor() {
        let spec = SubscriptionSpec::new("sub-1", "items").with_scope("workspace", "w1");
        let state = SubscriptionState::for_spec("profile-1", &spec, 1_000);
        assert_eq!(state.cursor, CURSOR_NONE);
        assert_eq!(state.status, SubscriptionStatus::Active);
        assert!(state.bootstrap_state.is_none());
    }
}
