//! Engine event bus and inspector ring.
//!
//! Listeners are plain callbacks held behind a mutex; emission clones the
//! current listener set and invokes outside the lock so a callback may
//! subscribe or unsubscribe reentrantly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tidesync_domain::constants::INSPECTOR_CAPACITY;
use tidesync_domain::{
    BootstrapProgress, ConflictRow, ConnectionState, EngineState, PresenceEntry, SyncFault,
    TransportMode,
};

/// Event emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum SyncEvent {
    SyncStart,
    SyncComplete {
        pushed: usize,
        pulled_subscriptions: usize,
    },
    SyncError(SyncFault),
    /// Inline realtime apply finished and the channel is caught up.
    SyncLive,
    StateChange(EngineState),
    DataChange {
        tables: Vec<String>,
    },
    OutboxChange {
        pending: i64,
    },
    ConnectionChange {
        state: ConnectionState,
        mode: TransportMode,
    },
    ConflictNew(ConflictRow),
    ConflictResolved {
        id: String,
    },
    BootstrapProgress(BootstrapProgress),
    PresenceChange {
        scope_key: String,
        entries: Vec<PresenceEntry>,
    },
}

impl SyncEvent {
    /// Stable event name, as shown in the inspector.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncStart => "sync:start",
            Self::SyncComplete { .. } => "sync:complete",
            Self::SyncError(_) => "sync:error",
            Self::SyncLive => "sync:live",
            Self::StateChange(_) => "state:change",
            Self::DataChange { .. } => "data:change",
            Self::OutboxChange { .. } => "outbox:change",
            Self::ConnectionChange { .. } => "connection:change",
            Self::ConflictNew(_) => "conflict:new",
            Self::ConflictResolved { .. } => "conflict:resolved",
            Self::BootstrapProgress(_) => "bootstrap:progress",
            Self::PresenceChange { .. } => "presence:change",
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

/// Listener registry.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned [`Subscription`] (or
    /// calling [`Subscription::unsubscribe`]) removes it.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, Arc::new(listener));
        Subscription { id, bus: Arc::downgrade(self) }
    }

    /// Deliver an event to every current listener.
    pub fn emit(&self, event: &SyncEvent) {
        let listeners: Vec<Listener> = lock(&self.inner).listeners.values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of live listeners (diagnostics).
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.inner).listeners.remove(&id);
    }
}

fn lock(mutex: &Mutex<BusInner>) -> std::sync::MutexGuard<'_, BusInner> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handle for one registered listener.
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Remove the listener now instead of at drop time.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// One captured event in the inspector ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorEntry {
    /// Monotonic id, never reused within a ring.
    pub id: u64,
    pub name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub payload: Value,
}

/// Bounded ring of the last N engine events, for debug UIs.
#[derive(Debug)]
pub struct InspectorRing {
    capacity: usize,
    next_id: u64,
    events: VecDeque<InspectorEntry>,
}

impl Default for InspectorRing {
    fn default() -> Self {
        Self::new(INSPECTOR_CAPACITY)
    }
}

impl InspectorRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), next_id: 0, events: VecDeque::new() }
    }

    /// Record an event, evicting the oldest entry when full.
    pub fn record(&mut self, event: &SyncEvent) {
        let payload = serde_json::to_value(event).unwrap_or(Value::Null);
        let entry = InspectorEntry {
            id: self.next_id,
            name: event.name().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        };
        self.next_id += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(entry);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<InspectorEntry> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
