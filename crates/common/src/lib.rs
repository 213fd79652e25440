//! Shared storage plumbing for Tidesync crates.
//!
//! This crate owns the SQLite connection pool and its error taxonomy.
//! It contains no sync logic; the repositories and engines in
//! `tidesync-infra` build on top of it.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod storage;

pub use storage::{
    SqliteConnection, SqlitePool, StorageError, StoragePoolConfig, StorageResult,
};
