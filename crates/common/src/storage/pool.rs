//! SQLite connection pool.
//!
//! r2d2-based pooling with per-connection pragma initialisation. Every
//! repository in the workspace goes through this pool; connections are
//! cheap to check out and automatically returned on drop.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{info, instrument};

use super::config::StoragePoolConfig;
use super::connection::SqliteConnection;
use super::pragmas::apply_connection_pragmas;
use crate::storage::error::{StorageError, StorageResult};

/// SQLite connection pool.
#[derive(Debug)]
pub struct SqlitePool {
    pool: Pool<SqliteConnectionManager>,
    config: StoragePoolConfig,
}

impl SqlitePool {
    /// Create a new pool for the database at `path`.
    ///
    /// Each connection runs the pragma batch (WAL, foreign keys, busy
    /// timeout) before it joins the pool. A connection is checked out once
    /// up-front so misconfiguration surfaces here rather than on first use.
    #[instrument(skip_all, fields(db_path = ?path.as_ref(), pool_size = config.max_size))]
    pub fn new<P: AsRef<Path>>(path: P, config: StoragePoolConfig) -> StorageResult<Self> {
        if config.max_size == 0 {
            return Err(StorageError::InvalidConfig("pool max_size must be at least 1".into()));
        }

        let pool_config = config.clone();
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |conn| {
            apply_connection_pragmas(conn, &pool_config)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)?;

        // Verify one connection before declaring the pool healthy.
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;
        drop(conn);

        info!(max_connections = config.max_size, "sqlite pool initialised");

        Ok(Self { pool, config })
    }

    /// Acquire a connection from the pool.
    pub fn get(&self) -> StorageResult<SqliteConnection> {
        let conn = self.pool.get().map_err(|e| {
            if self.pool.state().idle_connections == 0 {
                StorageError::PoolExhausted
            } else {
                StorageError::R2d2(e)
            }
        })?;
        Ok(SqliteConnection::new(conn))
    }

    /// Maximum number of connections this pool will open.
    pub fn max_size(&self) -> u32 {
        self.config.max_size
    }

    /// Configured busy timeout.
    pub fn busy_timeout(&self) -> Duration {
        self.config.busy_timeout
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn pool_creates_and_hands_out_connections() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = SqlitePool::new(&db_path, StoragePoolConfig::default()).unwrap();
        let conn = pool.get().unwrap();

        let one: i32 = conn.query_row("SELECT 1", &[], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
        assert_eq!(pool.max_size(), 10);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = StoragePoolConfig { max_size: 0, ..StoragePoolConfig::default() };
        let result = SqlitePool::new(&db_path, config);
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn connections_share_the_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = SqlitePool::new(&db_path, StoragePoolConfig::default()).unwrap();

        let writer = pool.get().unwrap();
        writer
            .execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT NOT NULL)", &[])
            .unwrap();
        writer
            .execute("INSERT INTO kv (k, v) VALUES (?1, ?2)", &[&"a" as &dyn rusqlite::ToSql, &"1"])
            .unwrap();

        let reader = pool.get().unwrap();
        let v: String =
            reader.query_row("SELECT v FROM kv WHERE k = ?1", &[&"a" as &dyn rusqlite::ToSql], |r| r.get(0)).unwrap();
        assert_eq!(v, "1");
    }
}
