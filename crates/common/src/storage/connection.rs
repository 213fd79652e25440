//! Pooled connection wrapper.

use std::ops::{Deref, DerefMut};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection as RusqliteConnection, Row, ToSql};

use crate::storage::error::{StorageError, StorageResult};

/// Pooled SQLite connection.
///
/// Wraps a pooled rusqlite connection; it is returned to the pool when
/// dropped. Derefs to [`rusqlite::Connection`], so the full rusqlite API
/// (including `transaction()`) is available to callers that map errors
/// themselves.
pub struct SqliteConnection {
    inner: PooledConnection<SqliteConnectionManager>,
}

impl SqliteConnection {
    /// Wrap a pooled connection.
    pub fn new(conn: PooledConnection<SqliteConnectionManager>) -> Self {
        Self { inner: conn }
    }

    /// Borrow the underlying rusqlite connection.
    pub fn inner(&self) -> &RusqliteConnection {
        &self.inner
    }

    /// Execute a statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> StorageResult<usize> {
        self.inner.execute(sql, params).map_err(StorageError::from)
    }

    /// Execute a SQL query that returns a single row.
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> StorageResult<T>
    where
        F: FnOnce(&Row<'_>) -> Result<T, rusqlite::Error>,
    {
        self.inner.query_row(sql, params, f).map_err(StorageError::from)
    }

    /// Query and map all result rows.
    pub fn query_map<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut f: F) -> StorageResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T, rusqlite::Error>,
    {
        let mut stmt = self.inner.prepare(sql).map_err(StorageError::from)?;
        let rows = stmt.query_map(params, |row| f(row)).map_err(StorageError::from)?;
        rows.collect::<Result<Vec<T>, _>>().map_err(StorageError::from)
    }
}

impl Deref for SqliteConnection {
    type Target = RusqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for SqliteConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
