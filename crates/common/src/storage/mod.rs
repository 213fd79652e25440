//! SQLite storage layer.
//!
//! Provides r2d2-based connection pooling with per-connection pragmas
//! (WAL, foreign keys, busy timeout) and a thin connection wrapper used
//! by the repository implementations.

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod pragmas;

pub use config::StoragePoolConfig;
pub use connection::SqliteConnection;
pub use error::{StorageError, StorageResult};
pub use pool::SqlitePool;
