//! Table handlers: how pulled data reaches application tables.
//!
//! A handler owns all SQL for one synced table. Handlers run inside the
//! pull transaction on a blocking thread; a failure aborts the whole apply.
//! The registry maps validated table names to handlers; unknown tables are
//! a well-defined error, never interpolated SQL.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Transaction;
use serde_json::Value;
use tidesync_domain::{Result, RowChange, ScopeMap, TidesyncError};

/// Identifier whitelist applied to every table and column name before it
/// reaches SQL text.
static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid")
});

/// Reject identifiers outside `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(TidesyncError::InvalidInput(format!("invalid SQL identifier: {name:?}")))
    }
}

/// Context for an incremental change application.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    pub commit_seq: Option<i64>,
    pub actor_id: Option<String>,
    pub created_at: Option<Value>,
}

/// One batch of snapshot rows.
#[derive(Debug)]
pub struct SnapshotBatch<'a> {
    pub rows: &'a [Value],
    pub is_first_page: bool,
    pub is_last_page: bool,
}

/// Application-table operations invoked by the pull engine.
pub trait TableHandler: Send + Sync {
    /// Apply one batch of bootstrap snapshot rows.
    fn apply_snapshot(
        &self,
        tx: &Transaction<'_>,
        scopes: &ScopeMap,
        batch: &SnapshotBatch<'_>,
    ) -> Result<()>;

    /// Apply one incremental row change.
    fn apply_change(
        &self,
        tx: &Transaction<'_>,
        ctx: &ApplyContext,
        change: &RowChange,
    ) -> Result<()>;

    /// Remove all locally synced rows for the given scopes.
    fn clear_all(&self, tx: &Transaction<'_>, scopes: &ScopeMap) -> Result<()>;

    /// Called before the first snapshot page of a bootstrap.
    fn on_snapshot_start(&self, _tx: &Transaction<'_>, _scopes: &ScopeMap) -> Result<()> {
        Ok(())
    }

    /// Called after the last snapshot page of a bootstrap.
    fn on_snapshot_end(&self, _tx: &Transaction<'_>, _scopes: &ScopeMap) -> Result<()> {
        Ok(())
    }
}

/// Registry of table handlers keyed by table name.
#[derive(Default)]
pub struct TableRegistry {
    handlers: HashMap<String, Arc<dyn TableHandler>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The table name must pass the identifier
    /// whitelist; re-registering a name replaces the previous handler.
    pub fn register(
        &mut self,
        table: impl Into<String>,
        handler: Arc<dyn TableHandler>,
    ) -> Result<()> {
        let table = table.into();
        validate_identifier(&table)?;
        self.handlers.insert(table, handler);
        Ok(())
    }

    /// Handler for a table; unknown tables are an error.
    pub fn get(&self, table: &str) -> Result<&Arc<dyn TableHandler>> {
        self.handlers
            .get(table)
            .ok_or_else(|| TidesyncError::InvalidInput(format!("no handler for table {table:?}")))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.handlers.contains_key(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    impl TableHandler for NoopHandler {
        fn apply_snapshot(
            &self,
            _tx: &Transaction<'_>,
            _scopes: &ScopeMap,
            _batch: &SnapshotBatch<'_>,
        ) -> Result<()> {
            Ok(())
        }

        fn apply_change(
            &self,
            _tx: &Transaction<'_>,
            _ctx: &ApplyContext,
            _change: &RowChange,
        ) -> Result<()> {
            Ok(())
        }

        fn clear_all(&self, _tx: &Transaction<'_>, _scopes: &ScopeMap) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn identifier_whitelist() {
        for good in ["items", "user_profiles", "_private", "Table9"] {
            validate_identifier(good).unwrap();
        }
        for bad in ["", "9items", "items; DROP TABLE x", "items-2", "a.b", "\"quoted\""] {
            assert!(validate_identifier(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn registry_rejects_bad_names_and_reports_unknown_tables() {
        let mut registry = TableRegistry::new();
        assert!(registry.register("items; --", Arc::new(NoopHandler)).is_err());

        registry.register("items", Arc::new(NoopHandler)).unwrap();
        assert!(registry.contains("items"));
        assert!(registry.get("items").is_ok());

        match registry.get("labels") {
            Err(err) => assert!(matches!(err, TidesyncError::InvalidInput(_))),
            Ok(_) => panic!("expected error"),
        }
    }
}
