//! Schema-driven table handler.
//!
//! Applications describe a synced table once (`TableSchema`) and get a
//! [`TableHandler`] that upserts/deletes rows from pulled JSON, plus the
//! column metadata the mutation recorder needs for local writes. All
//! identifiers pass the whitelist before any SQL text is composed.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::Transaction;
use serde_json::Value;
use tidesync_domain::{OpKind, Result, RowChange, ScopeMap, ScopeValue, TidesyncError};

use super::handler::{validate_identifier, ApplyContext, SnapshotBatch, TableHandler};
use crate::errors::map_sql_error;

/// Converts an in-memory column value to its store representation.
pub trait ColumnCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Value>;
}

/// One synced column.
pub struct ColumnSpec {
    pub name: String,
    pub codec: Option<Arc<dyn ColumnCodec>>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), codec: None }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ColumnCodec>) -> Self {
        self.codec = Some(codec);
        self
    }
}

/// Description of one synced application table.
pub struct TableSchema {
    pub table: String,
    pub id_column: String,
    /// Server row-version column; fed by `row_version` on pulled changes
    /// and read back for optimistic-concurrency guards on local mutations.
    pub version_column: Option<String>,
    /// Columns compared against subscription scopes in `clear_all`.
    pub scope_columns: Vec<String>,
    /// Data columns (excluding the id column).
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: table.into(),
            id_column: "id".into(),
            version_column: None,
            scope_columns: Vec::new(),
            columns,
        }
    }

    pub fn with_id_column(mut self, name: impl Into<String>) -> Self {
        self.id_column = name.into();
        self
    }

    pub fn with_version_column(mut self, name: impl Into<String>) -> Self {
        self.version_column = Some(name.into());
        self
    }

    pub fn with_scope_columns(mut self, names: Vec<String>) -> Self {
        self.scope_columns = names;
        self
    }

    /// Whitelist every identifier this schema will put into SQL.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.id_column)?;
        if let Some(version) = &self.version_column {
            validate_identifier(version)?;
        }
        for scope in &self.scope_columns {
            validate_identifier(scope)?;
        }
        for column in &self.columns {
            validate_identifier(&column.name)?;
        }
        Ok(())
    }

    fn storage_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![self.id_column.as_str()];
        names.extend(self.columns.iter().map(|c| c.name.as_str()));
        if let Some(version) = &self.version_column {
            if !names.contains(&version.as_str()) {
                names.push(version.as_str());
            }
        }
        names
    }
}

/// Generic [`TableHandler`] over a [`TableSchema`].
pub struct SchemaTableHandler {
    schema: Arc<TableSchema>,
    upsert_sql: String,
    delete_sql: String,
}

impl SchemaTableHandler {
    /// Validate the schema and precompute the SQL it needs.
    pub fn new(schema: Arc<TableSchema>) -> Result<Self> {
        schema.validate()?;

        let columns = schema.storage_columns();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != schema.id_column)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        let upsert_sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({values})
             ON CONFLICT ({id}) DO UPDATE SET {updates}",
            table = schema.table,
            cols = columns.join(", "),
            values = placeholders.join(", "),
            id = schema.id_column,
            updates = updates.join(", "),
        );
        let delete_sql = format!(
            "DELETE FROM {table} WHERE {id} = ?1",
            table = schema.table,
            id = schema.id_column
        );

        Ok(Self { schema, upsert_sql, delete_sql })
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Encode one column value for storage.
    fn encode_column(&self, spec: &ColumnSpec, value: Option<&Value>) -> Result<SqlValue> {
        let Some(value) = value else {
            return Ok(SqlValue::Null);
        };
        let encoded = match &spec.codec {
            Some(codec) => codec.encode(value)?,
            None => value.clone(),
        };
        Ok(json_to_sql(&encoded))
    }

    pub(crate) fn upsert_row(
        &self,
        tx: &Transaction<'_>,
        row: &Value,
        row_version: Option<i64>,
    ) -> Result<()> {
        let Some(object) = row.as_object() else {
            return Err(TidesyncError::InvalidInput(format!(
                "row for table {} is not a JSON object",
                self.schema.table
            )));
        };

        let id = object.get(&self.schema.id_column).and_then(Value::as_str).ok_or_else(|| {
            TidesyncError::InvalidInput(format!(
                "row for table {} is missing string id column {:?}",
                self.schema.table, self.schema.id_column
            ))
        })?;

        let mut params: Vec<SqlValue> = Vec::with_capacity(self.schema.columns.len() + 2);
        params.push(SqlValue::Text(id.to_string()));
        for spec in &self.schema.columns {
            params.push(self.encode_column(spec, object.get(&spec.name))?);
        }
        if let Some(version_column) = &self.schema.version_column {
            if !self.schema.columns.iter().any(|c| &c.name == version_column) {
                let version = row_version
                    .or_else(|| object.get(version_column).and_then(Value::as_i64));
                params.push(match version {
                    Some(v) => SqlValue::Integer(v),
                    None => SqlValue::Null,
                });
            }
        }

        tx.execute(&self.upsert_sql, rusqlite::params_from_iter(params))
            .map_err(map_sql_error)?;
        Ok(())
    }

    pub(crate) fn delete_row(&self, tx: &Transaction<'_>, row_id: &str) -> Result<()> {
        tx.execute(&self.delete_sql, rusqlite::params![row_id]).map_err(map_sql_error)?;
        Ok(())
    }

    /// Current value of the version column for a row, if both exist.
    pub(crate) fn read_row_version(
        &self,
        tx: &Transaction<'_>,
        row_id: &str,
    ) -> Result<Option<i64>> {
        let Some(version_column) = &self.schema.version_column else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {version_column} FROM {table} WHERE {id} = ?1",
            table = self.schema.table,
            id = self.schema.id_column
        );
        tx.query_row(&sql, rusqlite::params![row_id], |row| row.get::<_, Option<i64>>(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_sql_error(other)),
            })
    }
}

impl TableHandler for SchemaTableHandler {
    fn apply_snapshot(
        &self,
        tx: &Transaction<'_>,
        _scopes: &ScopeMap,
        batch: &SnapshotBatch<'_>,
    ) -> Result<()> {
        for row in batch.rows {
            self.upsert_row(tx, row, None)?;
        }
        Ok(())
    }

    fn apply_change(
        &self,
        tx: &Transaction<'_>,
        _ctx: &ApplyContext,
        change: &RowChange,
    ) -> Result<()> {
        match change.op {
            OpKind::Upsert => {
                let row = change.row_json.as_ref().ok_or_else(|| {
                    TidesyncError::InvalidInput(format!(
                        "upsert change for {}/{} carries no row",
                        change.table, change.row_id
                    ))
                })?;
                self.upsert_row(tx, row, change.row_version)
            }
            OpKind::Delete => {
                tx.execute(&self.delete_sql, rusqlite::params![change.row_id])
                    .map_err(map_sql_error)?;
                Ok(())
            }
        }
    }

    fn clear_all(&self, tx: &Transaction<'_>, scopes: &ScopeMap) -> Result<()> {
        let mut predicates: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        for column in &self.schema.scope_columns {
            let Some(value) = scopes.get(column) else { continue };
            match value {
                ScopeValue::One(v) => {
                    params.push(SqlValue::Text(v.clone()));
                    predicates.push(format!("{column} = ?{}", params.len()));
                }
                ScopeValue::Many(vs) => {
                    let start = params.len() + 1;
                    for v in vs {
                        params.push(SqlValue::Text(v.clone()));
                    }
                    let marks: Vec<String> =
                        (start..start + vs.len()).map(|i| format!("?{i}")).collect();
                    predicates.push(format!("{column} IN ({})", marks.join(", ")));
                }
            }
        }

        let sql = if predicates.is_empty() {
            format!("DELETE FROM {}", self.schema.table)
        } else {
            format!("DELETE FROM {} WHERE {}", self.schema.table, predicates.join(" AND "))
        };

        tx.execute(&sql, rusqlite::params_from_iter(params)).map_err(map_sql_error)?;
        Ok(())
    }
}

/// Map a JSON value to its SQLite representation. Arrays and objects are
/// stored as their JSON text.
pub(crate) fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidesync_domain::ScopeValue;

    use super::*;
    use crate::database::manager::test_support;

    fn items_schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(
                "items",
                vec![
                    ColumnSpec::new("name"),
                    ColumnSpec::new("workspace_id"),
                    ColumnSpec::new("meta"),
                ],
            )
            .with_version_column("row_version")
            .with_scope_columns(vec!["workspace_id".into()]),
        )
    }

    fn create_items_table(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "CREATE TABLE items (
                id TEXT PRIMARY KEY,
                name TEXT,
                workspace_id TEXT,
                meta TEXT,
                row_version INTEGER
            )",
        )
        .unwrap();
    }

    #[test]
    fn snapshot_rows_upsert_with_json_columns_as_text() {
        let (db, _dir) = test_support::manager();
        let mut conn = db.get_connection().unwrap();
        create_items_table(conn.inner());

        let handler = SchemaTableHandler::new(items_schema()).unwrap();
        let tx = conn.transaction().unwrap();
        let rows = vec![
            json!({"id": "1", "name": "A", "workspace_id": "w1", "meta": {"tags": ["x"]}}),
            json!({"id": "2", "name": "B", "workspace_id": "w1", "row_version": 4}),
        ];
        handler
            .apply_snapshot(
                &tx,
                &ScopeMap::new(),
                &SnapshotBatch { rows: &rows, is_first_page: true, is_last_page: true },
            )
            .unwrap();
        tx.commit().unwrap();

        let (meta, version): (String, Option<i64>) = conn
            .query_row(
                "SELECT meta, row_version FROM items WHERE id = '1'",
                &[],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(meta, "{\"tags\":[\"x\"]}");
        assert!(version.is_none());

        let version: i64 = conn
            .query_row("SELECT row_version FROM items WHERE id = '2'", &[], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 4);
    }

    #[test]
    fn changes_upsert_and_delete() {
        let (db, _dir) = test_support::manager();
        let mut conn = db.get_connection().unwrap();
        create_items_table(conn.inner());

        let handler = SchemaTableHandler::new(items_schema()).unwrap();
        let tx = conn.transaction().unwrap();

        let upsert = RowChange {
            table: "items".into(),
            row_id: "1".into(),
            op: OpKind::Upsert,
            row_json: Some(json!({"id": "1", "name": "A", "workspace_id": "w1"})),
            row_version: Some(7),
            scopes: None,
        };
        handler.apply_change(&tx, &ApplyContext::default(), &upsert).unwrap();

        let update = RowChange {
            row_json: Some(json!({"id": "1", "name": "A2", "workspace_id": "w1"})),
            row_version: Some(8),
            ..upsert.clone()
        };
        handler.apply_change(&tx, &ApplyContext::default(), &update).unwrap();

        let delete = RowChange {
            table: "items".into(),
            row_id: "1".into(),
            op: OpKind::Delete,
            row_json: None,
            row_version: None,
            scopes: None,
        };

        let (name, version): (String, i64) = tx
            .query_row("SELECT name, row_version FROM items WHERE id = '1'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "A2");
        assert_eq!(version, 8);

        handler.apply_change(&tx, &ApplyContext::default(), &delete).unwrap();
        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
        tx.commit().unwrap();
    }

    #[test]
    fn upsert_without_row_payload_is_an_error() {
        let (db, _dir) = test_support::manager();
        let mut conn = db.get_connection().unwrap();
        create_items_table(conn.inner());

        let handler = SchemaTableHandler::new(items_schema()).unwrap();
        let tx = conn.transaction().unwrap();
        let change = RowChange {
            table: "items".into(),
            row_id: "1".into(),
            op: OpKind::Upsert,
            row_json: None,
            row_version: None,
            scopes: None,
        };
        let err = handler.apply_change(&tx, &ApplyContext::default(), &change).unwrap_err();
        assert!(matches!(err, TidesyncError::InvalidInput(_)));
    }

    #[test]
    fn clear_all_honours_scopes() {
        let (db, _dir) = test_support::manager();
        let mut conn = db.get_connection().unwrap();
        create_items_table(conn.inner());
        conn.inner()
            .execute_batch(
                "INSERT INTO items (id, name, workspace_id) VALUES
                    ('1', 'A', 'w1'), ('2', 'B', 'w1'), ('3', 'C', 'w2')",
            )
            .unwrap();

        let handler = SchemaTableHandler::new(items_schema()).unwrap();
        let tx = conn.transaction().unwrap();

        let mut scopes = ScopeMap::new();
        scopes.insert("workspace_id".into(), ScopeValue::One("w1".into()));
        handler.clear_all(&tx, &scopes).unwrap();

        let remaining: i64 =
            tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)).unwrap();
        assert_eq!(remaining, 1);

        // Empty scopes clear everything.
        handler.clear_all(&tx, &ScopeMap::new()).unwrap();
        let remaining: i64 =
            tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)).unwrap();
        assert_eq!(remaining, 0);
        tx.commit().unwrap();
    }

    #[test]
    fn codecs_transform_values_before_storage() {
        struct UpperCodec;
        impl ColumnCodec for UpperCodec {
            fn encode(&self, value: &Value) -> Result<Value> {
                Ok(match value.as_str() {
                    Some(s) => Value::String(s.to_uppercase()),
                    None => value.clone(),
                })
            }
        }

        let (db, _dir) = test_support::manager();
        let mut conn = db.get_connection().unwrap();
        create_items_table(conn.inner());

        let schema = Arc::new(TableSchema::new(
            "items",
            vec![ColumnSpec::new("name").with_codec(Arc::new(UpperCodec))],
        ));
        let handler = SchemaTableHandler::new(schema).unwrap();

        let tx = conn.transaction().unwrap();
        let rows = vec![json!({"id": "1", "name": "quiet"})];
        handler
            .apply_snapshot(
                &tx,
                &ScopeMap::new(),
                &SnapshotBatch { rows: &rows, is_first_page: true, is_last_page: true },
            )
            .unwrap();

        let name: String =
            tx.query_row("SELECT name FROM items WHERE id = '1'", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "QUIET");
        tx.commit().unwrap();
    }

    #[test]
    fn schema_with_bad_identifiers_is_rejected() {
        let schema = Arc::new(TableSchema::new(
            "items",
            vec![ColumnSpec::new("name; DROP TABLE items")],
        ));
        assert!(SchemaTableHandler::new(schema).is_err());
    }
}
