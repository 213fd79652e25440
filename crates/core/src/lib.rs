//! # Tidesync Core
//!
//! Ports and pure sync logic - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port/adapter interfaces for the repositories and the transport
//! - The plugin contract and its ordering rules
//! - Error classification and the retry backoff schedule
//! - The fingerprint map, event bus, inspector ring, and progress projection
//! - The SRF1 snapshot chunk codec
//!
//! ## Architecture Principles
//! - Only depends on `tidesync-domain`
//! - No database or HTTP code
//! - All external dependencies via traits

pub mod codec;
pub mod sync;

// Re-export specific items to avoid ambiguity
pub use codec::srf1::{decode_chunk, encode_frames, SnapshotBatcher};
pub use sync::backoff::retry_delay;
pub use sync::classify::classify_error;
pub use sync::events::{EventBus, InspectorEntry, InspectorRing, SyncEvent, Subscription};
pub use sync::fingerprint::FingerprintMap;
pub use sync::plugin::{plugins_ascending, plugins_descending, wants_after_pull, SyncPlugin};
pub use sync::ports::{
    ChunkByteStream, ConflictStore, MigrationRunner, OutboxQueue, RealtimeCallbacks,
    RealtimeSession, RealtimeTransport, SubscriptionStore, SyncTransport,
};
pub use sync::progress::project_progress;
