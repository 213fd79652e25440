//! # Tidesync Infrastructure
//!
//! Infrastructure implementations of the core ports plus the sync engine
//! itself.
//!
//! This crate contains:
//! - SQLite-backed repositories (outbox, subscription state, conflicts)
//! - Schema management and migrations
//! - The table-handler registry and the schema-driven default handler
//! - The mutation recorder
//! - The pull/push engines, the sync cycle, and the `SyncEngine`
//!   orchestrator
//!
//! ## Architecture
//! - Implements traits defined in `tidesync-core`
//! - Depends on `tidesync-common`, `tidesync-domain`, and `tidesync-core`
//! - Contains all "impure" code (I/O, timers, tasks)

pub mod database;
pub mod errors;
pub mod sync;

// Re-export commonly used items
pub use database::handler::{ApplyContext, SnapshotBatch, TableHandler, TableRegistry};
pub use database::manager::DbManager;
pub use database::recorder::{MutationOptions, MutationRecorder};
pub use database::schema_handler::{ColumnCodec, ColumnSpec, SchemaTableHandler, TableSchema};
pub use database::{
    SqliteConflictStore, SqliteOutboxRepository, SqliteSubscriptionStore,
};
pub use errors::InfraError;
pub use sync::engine::{
    DataChangeDebounce, ResetOptions, ResetReport, ResetScope, SyncEngine, SyncEngineConfig,
    SyncEngineDeps, SyncReport,
};
pub use sync::pull::{ApplySummary, PullEngine, PullLimits};
pub use sync::push::{PushEngine, PushOutcome};
