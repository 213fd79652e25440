//! Sync engine orchestrator.
//!
//! Owns lifecycle, transport-mode selection and health, the polling and
//! fallback timers, sync coalescing, the realtime inline-apply fast path,
//! retry scheduling, the event bus and inspector, presence, and the
//! reset/repair flows. All in-memory maps live behind short-lived locks;
//! every blocking SQLite call runs on a dedicated thread.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tidesync_core::{
    classify_error, plugins_ascending, project_progress, retry_delay, wants_after_pull,
    ConflictStore, EventBus, FingerprintMap, InspectorEntry, InspectorRing, MigrationRunner,
    OutboxQueue, RealtimeCallbacks, RealtimeSession, RealtimeTransport, SubscriptionStore,
    Subscription, SyncEvent, SyncPlugin, SyncTransport,
};
use tidesync_domain::constants::{
    CURSOR_NONE, DEFAULT_AWAIT_TIMEOUT, DEFAULT_DATA_CHANGE_DEBOUNCE,
    DEFAULT_FALLBACK_POLL_INTERVAL, DEFAULT_MAX_PULL_ROUNDS, DEFAULT_MAX_PUSH_COMMITS,
    DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_CATCHUP_DELAY,
};
use tidesync_domain::{
    ChannelPhase, ConflictResolution, ConflictRow, ConnectionState, DiagnosticsSnapshot,
    EngineState, EnqueueReceipt, FallbackReason, Operation, OutboxStatus, PresenceAction,
    PresenceEntry, PresenceEvent, PushResponse, RealtimeConnectionState, RealtimeEvent,
    RealtimeSyncData, Result, SubscriptionCursorSummary, SubscriptionSpec, SyncErrorCode,
    SyncFault, SyncProgress, SyncRequest, TidesyncError, TransportHealth, TransportMode,
};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::database::handler::{ApplyContext, TableRegistry};
use crate::database::manager::{now_ms, DbManager};
use crate::database::recorder::{MutationOptions, MutationRecorder};
use crate::database::schema_handler::SchemaTableHandler;
use crate::database::subscription_repository as subs;
use crate::errors::{map_join_error, map_sql_error};
use crate::sync::cycle::{run_cycle, CycleConfig};
use crate::sync::pull::{PullEngine, PullLimits};
use crate::sync::push::PushEngine;

/// Debounce windows for `data:change`. `None` (or a zero duration) emits
/// synchronously.
#[derive(Debug, Clone)]
pub struct DataChangeDebounce {
    pub idle: Option<Duration>,
    pub while_syncing: Option<Duration>,
    pub while_reconnecting: Option<Duration>,
}

impl Default for DataChangeDebounce {
    fn default() -> Self {
        Self {
            idle: Some(DEFAULT_DATA_CHANGE_DEBOUNCE),
            while_syncing: Some(Duration::from_millis(100)),
            while_reconnecting: Some(Duration::from_millis(250)),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub client_id: String,
    /// Profile id scoping subscription state ("stateId").
    pub state_id: String,
    pub actor_id: Option<String>,
    pub realtime_enabled: bool,
    pub poll_interval: Duration,
    pub fallback_poll_interval: Duration,
    pub reconnect_catchup_delay: Duration,
    pub max_retries: u32,
    pub max_push_commits: u32,
    pub max_pull_rounds: u32,
    pub pull_limits: PullLimits,
    pub data_change_debounce: DataChangeDebounce,
    pub await_timeout: Duration,
}

impl SyncEngineConfig {
    pub fn new(client_id: impl Into<String>, state_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state_id: state_id.into(),
            actor_id: None,
            realtime_enabled: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fallback_poll_interval: DEFAULT_FALLBACK_POLL_INTERVAL,
            reconnect_catchup_delay: DEFAULT_RECONNECT_CATCHUP_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_push_commits: DEFAULT_MAX_PUSH_COMMITS,
            max_pull_rounds: DEFAULT_MAX_PULL_ROUNDS,
            pull_limits: PullLimits::default(),
            data_change_debounce: DataChangeDebounce::default(),
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
        }
    }
}

/// Injected collaborators.
pub struct SyncEngineDeps {
    pub db: Arc<DbManager>,
    pub registry: Arc<TableRegistry>,
    /// Schema handlers the mutation recorder writes through, keyed by
    /// table name.
    pub schemas: HashMap<String, Arc<SchemaTableHandler>>,
    pub outbox: Arc<dyn OutboxQueue>,
    pub subscriptions_store: Arc<dyn SubscriptionStore>,
    pub conflicts: Arc<dyn ConflictStore>,
    pub transport: Arc<dyn SyncTransport>,
    pub plugins: Vec<Arc<dyn SyncPlugin>>,
    pub migration_runner: Option<Arc<dyn MigrationRunner>>,
    pub subscriptions: Vec<SubscriptionSpec>,
}

/// Result of one successful sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled_subscriptions: usize,
    pub changed_tables: Vec<String>,
}

/// Reset scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Everything for the configured profile.
    State,
    /// Specific subscriptions of the configured profile.
    Subscriptions,
    /// Every profile in the store.
    All,
}

/// Options for [`SyncEngine::reset`].
#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub scope: ResetScope,
    pub subscription_ids: Option<Vec<String>>,
    pub clear_outbox: bool,
    pub clear_conflicts: bool,
    pub clear_synced_tables: bool,
}

/// Counts of what a reset removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub deleted_subscription_states: u64,
    pub deleted_outbox_commits: u64,
    pub deleted_conflicts: u64,
    pub cleared_tables: Vec<String>,
}

type SyncOutcome = std::result::Result<SyncReport, SyncFault>;

enum EngineSignal {
    Event(RealtimeEvent),
    State(RealtimeConnectionState),
    Presence(PresenceEvent),
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    destroyed: bool,
    migrations_ran: bool,
}

#[derive(Default)]
struct InFlightSync {
    running: Option<broadcast::Sender<SyncOutcome>>,
    requested: bool,
}

#[derive(Default)]
struct DebounceState {
    pending: BTreeSet<String>,
    timer_running: bool,
}

/// The sync engine.
pub struct SyncEngine {
    config: SyncEngineConfig,
    db: Arc<DbManager>,
    outbox: Arc<dyn OutboxQueue>,
    subscriptions_store: Arc<dyn SubscriptionStore>,
    conflicts: Arc<dyn ConflictStore>,
    transport: Arc<dyn SyncTransport>,
    registry: Arc<TableRegistry>,
    plugins: Vec<Arc<dyn SyncPlugin>>,
    migration_runner: Option<Arc<dyn MigrationRunner>>,
    recorder: MutationRecorder,
    push_engine: PushEngine,
    pull_engine: PullEngine,

    bus: Arc<EventBus>,
    inspector: Mutex<InspectorRing>,
    state: Mutex<EngineState>,
    health: Mutex<TransportHealth>,
    fingerprints: Mutex<FingerprintMap>,
    presence: Mutex<HashMap<String, Vec<PresenceEntry>>>,
    bootstraps: Mutex<HashMap<String, (usize, usize)>>,
    desired: Mutex<Vec<SubscriptionSpec>>,
    seen_conflicts: Mutex<HashSet<String>>,

    lifecycle: Mutex<Lifecycle>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    inflight: Mutex<InFlightSync>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    catchup_task: Mutex<Option<JoinHandle<()>>>,
    fallback_task: Mutex<Option<JoinHandle<()>>>,
    debounce: Mutex<DebounceState>,
    realtime_session: TokioMutex<Option<Arc<dyn RealtimeSession>>>,
    connected_once: AtomicBool,
    progress_notify: Notify,
}

impl SyncEngine {
    /// Build an engine. Applies the sync schema so the repositories are
    /// usable before `start()`.
    pub fn new(config: SyncEngineConfig, deps: SyncEngineDeps) -> Result<Arc<Self>> {
        deps.db.run_migrations()?;

        let transport_mode = if config.realtime_enabled && deps.transport.realtime().is_some() {
            TransportMode::Realtime
        } else {
            TransportMode::Polling
        };

        let recorder = MutationRecorder::new(Arc::clone(&deps.db), deps.schemas);
        let push_engine = PushEngine::new(
            config.client_id.clone(),
            Arc::clone(&deps.outbox),
            Arc::clone(&deps.conflicts),
            Arc::clone(&deps.transport),
            deps.plugins.clone(),
        );
        let pull_engine = PullEngine::new(
            Arc::clone(&deps.db),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.transport),
            deps.plugins.clone(),
        );

        Ok(Arc::new(Self {
            db: deps.db,
            outbox: deps.outbox,
            subscriptions_store: deps.subscriptions_store,
            conflicts: deps.conflicts,
            transport: deps.transport,
            registry: deps.registry,
            plugins: deps.plugins,
            migration_runner: deps.migration_runner,
            recorder,
            push_engine,
            pull_engine,
            bus: Arc::new(EventBus::new()),
            inspector: Mutex::new(InspectorRing::default()),
            state: Mutex::new(EngineState::initial(transport_mode)),
            health: Mutex::new(TransportHealth::initial(transport_mode)),
            fingerprints: Mutex::new(FingerprintMap::new()),
            presence: Mutex::new(HashMap::new()),
            bootstraps: Mutex::new(HashMap::new()),
            desired: Mutex::new(deps.subscriptions),
            seen_conflicts: Mutex::new(HashSet::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            inflight: Mutex::new(InFlightSync::default()),
            retry_task: Mutex::new(None),
            catchup_task: Mutex::new(None),
            fallback_task: Mutex::new(None),
            debounce: Mutex::new(DebounceState::default()),
            realtime_session: TokioMutex::new(None),
            connected_once: AtomicBool::new(false),
            progress_notify: Notify::new(),
            config,
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine: run migrations once (best-effort push first),
    /// select the transport mode, and trigger one sync.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.destroyed {
                return Err(TidesyncError::Lifecycle("engine is destroyed".into()));
            }
            if lifecycle.started {
                return Ok(());
            }
        }

        self.run_user_migrations_once().await?;

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.started = true;
        }
        *self.cancel.lock() = CancellationToken::new();

        let realtime = if self.config.realtime_enabled { self.transport.realtime() } else { None };
        let mode =
            if realtime.is_some() { TransportMode::Realtime } else { TransportMode::Polling };
        self.health.lock().mode = mode;
        self.update_state(|s| {
            s.enabled = true;
            s.transport_mode = mode;
        });

        match realtime {
            Some(rt) => {
                if let Err(err) = self.connect_realtime(rt).await {
                    warn!(error = %err, "realtime connect failed, falling back to polling");
                    self.health.lock().fallback_reason = Some(FallbackReason::Network);
                    self.start_fallback_poller();
                }
            }
            None => {
                let handle = self.spawn_poller(self.config.poll_interval);
                self.tasks.lock().push(handle);
            }
        }

        info!(mode = ?mode, "sync engine started");
        self.spawn_background_sync();
        Ok(())
    }

    /// Stop timers and disconnect without destroying listeners.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.started = false;
        }
        self.cancel.lock().cancel();

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        for slot in [&self.retry_task, &self.catchup_task, &self.fallback_task] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }

        if let Some(session) = self.realtime_session.lock().await.take() {
            session.disconnect().await;
        }

        self.update_state(|s| {
            s.enabled = false;
            s.is_syncing = false;
            s.is_retrying = false;
            s.connection_state = ConnectionState::Disconnected;
        });

        debug!("sync engine stopped");
        Ok(())
    }

    /// Stop permanently; a destroyed engine cannot be restarted.
    pub async fn destroy(&self) -> Result<()> {
        self.stop().await?;
        self.lifecycle.lock().destroyed = true;
        self.presence.lock().clear();
        Ok(())
    }

    async fn run_user_migrations_once(self: &Arc<Self>) -> Result<()> {
        let Some(runner) = self.migration_runner.clone() else { return Ok(()) };
        if self.lifecycle.lock().migrations_ran {
            return Ok(());
        }

        // Best-effort push first: unsynced writes must not die with a
        // migration that resets application tables.
        for _ in 0..self.config.max_push_commits {
            match self.push_engine.push_once(None).await {
                Ok(outcome) if outcome.pushed => continue,
                Ok(_) => break,
                Err(err) => {
                    debug!(error = %err, "best-effort pre-migration push stopped");
                    break;
                }
            }
        }

        if let Err(err) = runner.run().await {
            let fault =
                SyncFault::new(SyncErrorCode::MigrationFailed, err.to_string(), false);
            self.update_state(|s| {
                s.enabled = false;
                s.error = Some(fault.clone());
            });
            self.emit(SyncEvent::SyncError(fault));
            return Err(TidesyncError::Migration(err.to_string()));
        }

        self.lifecycle.lock().migrations_ran = true;
        Ok(())
    }

    // ========================================================================
    // Sync coalescing and the cycle
    // ========================================================================

    /// Run (or join) a sync. Concurrent callers share the in-flight cycle;
    /// a request arriving mid-cycle causes exactly one follow-up sync.
    pub async fn sync(self: &Arc<Self>) -> Result<SyncReport> {
        enum Role {
            Runner,
            Waiter(broadcast::Receiver<SyncOutcome>),
        }

        let role = {
            let mut inflight = self.inflight.lock();
            match &inflight.running {
                Some(tx) => {
                    let rx = tx.subscribe();
                    inflight.requested = true;
                    Role::Waiter(rx)
                }
                None => {
                    let (tx, _rx) = broadcast::channel(4);
                    inflight.running = Some(tx);
                    Role::Runner
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => match rx.recv().await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(fault)) => Err(fault_into_error(fault)),
                Err(_) => Err(TidesyncError::Internal("sync runner went away".into())),
            },
            Role::Runner => {
                let outcome = self.run_sync_cycle().await;

                let requested = {
                    let mut inflight = self.inflight.lock();
                    let sender = inflight.running.take();
                    let requested = inflight.requested;
                    inflight.requested = false;
                    if let Some(sender) = sender {
                        let _ = sender.send(outcome.clone());
                    }
                    requested
                };
                if requested {
                    self.spawn_background_sync();
                }

                outcome.map_err(fault_into_error)
            }
        }
    }

    fn is_sync_in_flight(&self) -> bool {
        self.inflight.lock().running.is_some()
    }

    fn spawn_background_sync(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.sync().await;
        });
    }

    async fn run_sync_cycle(self: &Arc<Self>) -> SyncOutcome {
        if self.lifecycle.lock().destroyed || !self.state.lock().enabled {
            return Err(SyncFault::new(
                SyncErrorCode::SyncError,
                "engine is not running",
                false,
            ));
        }

        self.update_state(|s| {
            s.is_syncing = true;
            if s.connection_state == ConnectionState::Disconnected {
                s.connection_state = ConnectionState::Connecting;
            }
        });
        self.emit(SyncEvent::SyncStart);

        let desired = self.desired.lock().clone();
        let session = self.realtime_session.lock().await.clone();
        let cycle_config = CycleConfig {
            state_id: self.config.state_id.clone(),
            client_id: self.config.client_id.clone(),
            max_push_commits: self.config.max_push_commits,
            max_pull_rounds: self.config.max_pull_rounds,
            limits: self.config.pull_limits.clone(),
        };

        let result = run_cycle(
            &self.outbox,
            &self.push_engine,
            &self.pull_engine,
            &self.transport,
            session.as_deref(),
            &desired,
            &cycle_config,
        )
        .await;

        match result {
            Ok(report) => Ok(self.after_cycle_success(report).await),
            Err(err) => {
                let fault = classify_error(&err);
                self.after_cycle_failure(fault.clone());
                Err(fault)
            }
        }
    }

    async fn after_cycle_success(
        self: &Arc<Self>,
        report: crate::sync::cycle::CycleReport,
    ) -> SyncReport {
        let pending = self.outbox.pending_count().await.unwrap_or_else(|err| {
            warn!(error = %err, "pending count unavailable after sync");
            0
        });
        let now = now_ms();

        self.update_state(|s| {
            s.is_syncing = false;
            s.last_sync_at = Some(now);
            s.error = None;
            s.retry_count = 0;
            s.is_retrying = false;
            s.connection_state = ConnectionState::Connected;
            s.pending_count = pending;
        });
        self.health.lock().last_successful_poll_at = Some(now);

        {
            let mut fingerprints = self.fingerprints.lock();
            for (table, row_id) in &report.apply.row_changes {
                fingerprints.bump_row(table, row_id);
            }
            for table in &report.apply.bulk_tables {
                fingerprints.bump_table(table);
            }
            for table in &report.apply.cleared_tables {
                fingerprints.bump_table(table);
            }
        }

        {
            let mut bootstraps = self.bootstraps.lock();
            for event in &report.apply.bootstrap_events {
                if event.done {
                    bootstraps.remove(&event.subscription_id);
                } else {
                    bootstraps.insert(
                        event.subscription_id.clone(),
                        (event.tables_processed, event.tables_total),
                    );
                }
            }
        }
        for event in report.apply.bootstrap_events.clone() {
            self.emit(SyncEvent::BootstrapProgress(event));
        }

        for conflict in report.new_conflicts.clone() {
            self.note_conflict(conflict);
        }

        let changed_tables = report.apply.changed_tables();
        if !changed_tables.is_empty() {
            self.queue_data_change(changed_tables.clone());
        }
        self.emit(SyncEvent::OutboxChange { pending });
        self.emit(SyncEvent::SyncComplete {
            pushed: report.pushed,
            pulled_subscriptions: report.pulled_subscriptions,
        });
        self.progress_notify.notify_waiters();

        SyncReport {
            pushed: report.pushed,
            pulled_subscriptions: report.pulled_subscriptions,
            changed_tables,
        }
    }

    fn after_cycle_failure(self: &Arc<Self>, fault: SyncFault) {
        let mut retry_count_after = 0;
        self.update_state(|s| {
            s.is_syncing = false;
            s.retry_count += 1;
            retry_count_after = s.retry_count;
            s.error = Some(fault.clone());
            if fault.code == SyncErrorCode::NetworkError {
                s.connection_state = ConnectionState::Disconnected;
            }
        });
        self.emit(SyncEvent::SyncError(fault.clone()));

        if fault.retryable && retry_count_after < self.config.max_retries {
            let delay = retry_delay(retry_count_after);
            debug!(retry_count = retry_count_after, delay_ms = delay.as_millis() as u64,
                "scheduling sync retry");
            self.update_state(|s| s.is_retrying = true);
            self.schedule_retry(delay);
        }
        self.progress_notify.notify_waiters();
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let engine = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    engine.update_state(|s| s.is_retrying = false);
                    let _ = engine.sync().await;
                }
            }
        });
        if let Some(previous) = self.retry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    // ========================================================================
    // Transport mode, timers, and realtime handling
    // ========================================================================

    fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick; start() already triggers a sync.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !engine.is_sync_in_flight() {
                            let _ = engine.sync().await;
                        }
                    }
                }
            }
        })
    }

    fn start_fallback_poller(self: &Arc<Self>) {
        let handle = self.spawn_poller(self.config.fallback_poll_interval);
        if let Some(previous) = self.fallback_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_fallback_poller(&self) {
        if let Some(handle) = self.fallback_task.lock().take() {
            handle.abort();
        }
    }

    async fn connect_realtime(self: &Arc<Self>, rt: Arc<dyn RealtimeTransport>) -> Result<()> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<EngineSignal>();

        let callbacks = RealtimeCallbacks {
            on_event: Arc::new({
                let tx = signal_tx.clone();
                move |event| {
                    let _ = tx.send(EngineSignal::Event(event));
                }
            }),
            on_state_change: Arc::new({
                let tx = signal_tx.clone();
                move |state| {
                    let _ = tx.send(EngineSignal::State(state));
                }
            }),
            on_presence: Some(Arc::new(move |event| {
                let _ = signal_tx.send(EngineSignal::Presence(event));
            })),
        };

        let session = rt.connect(&self.config.client_id, callbacks).await?;
        *self.realtime_session.lock().await = Some(Arc::from(session));

        let engine = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = signal_rx.recv() => match signal {
                        Some(EngineSignal::Event(RealtimeEvent::Sync(data))) => {
                            engine.handle_realtime_sync(data).await;
                        }
                        Some(EngineSignal::State(state)) => {
                            engine.handle_realtime_state(state);
                        }
                        Some(EngineSignal::Presence(event)) => {
                            engine.apply_presence_event(event);
                        }
                        None => break,
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    fn handle_realtime_state(self: &Arc<Self>, state: RealtimeConnectionState) {
        match state {
            RealtimeConnectionState::Connected => {
                {
                    let mut health = self.health.lock();
                    health.connected = true;
                    health.fallback_reason = None;
                    health.last_realtime_message_at = Some(now_ms());
                }
                self.stop_fallback_poller();
                let first = !self.connected_once.swap(true, Ordering::SeqCst);
                self.update_state(|s| s.connection_state = ConnectionState::Connected);

                if first {
                    // Immediate catch-up on the first connect.
                    self.spawn_background_sync();
                } else {
                    // Delayed catch-up after a reconnect absorbs the
                    // post-reconnect burst.
                    let engine = Arc::clone(self);
                    let delay = self.config.reconnect_catchup_delay;
                    let cancel = self.cancel.lock().clone();
                    let handle = tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {
                                let _ = engine.sync().await;
                            }
                        }
                    });
                    if let Some(previous) = self.catchup_task.lock().replace(handle) {
                        previous.abort();
                    }
                }
            }
            RealtimeConnectionState::Connecting => {
                let reconnecting = self.connected_once.load(Ordering::SeqCst);
                self.update_state(|s| {
                    s.connection_state = if reconnecting {
                        ConnectionState::Reconnecting
                    } else {
                        ConnectionState::Connecting
                    };
                });
            }
            RealtimeConnectionState::Disconnected => {
                {
                    let mut health = self.health.lock();
                    health.connected = false;
                    health.fallback_reason = Some(FallbackReason::Network);
                }
                let reconnecting = self.connected_once.load(Ordering::SeqCst);
                self.update_state(|s| {
                    s.connection_state = if reconnecting {
                        ConnectionState::Reconnecting
                    } else {
                        ConnectionState::Disconnected
                    };
                });
                self.start_fallback_poller();
            }
        }
    }

    /// Handle a realtime `sync` delivery: inline-apply when safe, full
    /// sync otherwise.
    async fn handle_realtime_sync(self: &Arc<Self>, data: RealtimeSyncData) {
        self.health.lock().last_realtime_message_at = Some(now_ms());

        let changes = match &data.changes {
            Some(changes) if !changes.is_empty() => changes.clone(),
            _ => {
                // Cursor-only wake-up.
                self.spawn_background_sync();
                return;
            }
        };

        let pending = self.outbox.pending_count().await.unwrap_or(1);
        if self.is_sync_in_flight() || pending > 0 || wants_after_pull(&self.plugins) {
            // Push-before-pull ordering and plugin transforms require the
            // full pipeline.
            self.spawn_background_sync();
            return;
        }

        match self.apply_ws_changes(&changes, data.cursor).await {
            Ok(affected) => {
                {
                    let mut fingerprints = self.fingerprints.lock();
                    for (table, row_id) in &affected {
                        fingerprints.bump_row(table, row_id);
                    }
                }
                let mut tables: Vec<String> =
                    affected.iter().map(|(table, _)| table.clone()).collect();
                tables.sort();
                tables.dedup();
                self.queue_data_change(tables);
                self.emit(SyncEvent::SyncComplete { pushed: 0, pulled_subscriptions: 0 });
                self.emit(SyncEvent::SyncLive);
                self.progress_notify.notify_waiters();
            }
            Err(err) => {
                warn!(error = %err, "inline realtime apply failed, scheduling full sync");
                self.spawn_background_sync();
            }
        }
    }

    /// Apply realtime-delivered changes in one transaction; cursors only
    /// advance when every change applied.
    async fn apply_ws_changes(
        &self,
        changes: &[tidesync_domain::RowChange],
        cursor: Option<i64>,
    ) -> Result<Vec<(String, String)>> {
        let db = Arc::clone(&self.db);
        let registry = Arc::clone(&self.registry);
        let state_id = self.config.state_id.clone();
        let changes = changes.to_vec();

        tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;

            let ctx = ApplyContext { commit_seq: cursor, actor_id: None, created_at: None };
            let mut affected = Vec::with_capacity(changes.len());
            for change in &changes {
                registry.get(&change.table)?.apply_change(&tx, &ctx, change)?;
                affected.push((change.table.clone(), change.row_id.clone()));
            }

            if let Some(cursor) = cursor {
                for mut row in subs::list_rows(&tx, &state_id)? {
                    if row.cursor < cursor && row.bootstrap_state.is_none() {
                        row.cursor = cursor;
                        row.updated_at = now_ms();
                        subs::upsert_in_tx(&tx, &row)?;
                    }
                }
            }

            tx.commit().map_err(map_sql_error)?;
            Ok(affected)
        })
        .await
        .map_err(map_join_error)?
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Record a local commit (application rows + outbox row in one
    /// transaction) and nudge replication.
    pub async fn mutate(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        options: MutationOptions,
    ) -> Result<EnqueueReceipt> {
        let mut operations = operations;
        for plugin in plugins_ascending(&self.plugins) {
            plugin.before_apply_local_mutations(&mut operations).await.map_err(|err| {
                TidesyncError::Plugin(format!(
                    "before_apply_local_mutations {}: {err}",
                    plugin.name()
                ))
            })?;
        }

        let outcome = self.recorder.record_local_commit(operations, options).await?;

        {
            let mut fingerprints = self.fingerprints.lock();
            for (table, row_id) in &outcome.affected {
                fingerprints.bump_row(table, row_id);
            }
        }
        let mut tables: Vec<String> =
            outcome.affected.iter().map(|(table, _)| table.clone()).collect();
        tables.sort();
        tables.dedup();
        self.queue_data_change(tables);

        let pending = self.outbox.pending_count().await.unwrap_or(0);
        self.update_state(|s| s.pending_count = pending);
        self.emit(SyncEvent::OutboxChange { pending });

        if self.state.lock().enabled {
            self.spawn_background_sync();
        }
        Ok(outcome.receipt)
    }

    /// Stateless direct-push path: no outbox, no local rows.
    pub async fn push_direct(
        &self,
        operations: Vec<Operation>,
        client_commit_id: Option<String>,
    ) -> Result<PushResponse> {
        let request = MutationRecorder::build_direct_push(operations, client_commit_id);
        let response = self
            .transport
            .sync(SyncRequest {
                client_id: self.config.client_id.clone(),
                push: Some(request),
                pull: None,
            })
            .await?;
        response
            .push
            .ok_or_else(|| TidesyncError::transport("combined response is missing the push section"))
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Resolve a conflict; emits `conflict:resolved` only on the actual
    /// transition.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: ConflictResolution,
    ) -> Result<ConflictRow> {
        let (row, newly_resolved) = self.conflicts.resolve(id, &resolution).await?;
        if newly_resolved {
            self.emit(SyncEvent::ConflictResolved { id: row.id.clone() });
        }
        Ok(row)
    }

    /// Sweep unresolved conflicts, emitting `conflict:new` once per
    /// distinct id across successive sweeps.
    pub async fn check_pending_conflicts(&self) -> Result<Vec<ConflictRow>> {
        let unresolved = self.conflicts.unresolved().await?;
        for conflict in unresolved.clone() {
            self.note_conflict(conflict);
        }
        Ok(unresolved)
    }

    fn note_conflict(&self, conflict: ConflictRow) {
        let fresh = self.seen_conflicts.lock().insert(conflict.id.clone());
        if fresh {
            self.emit(SyncEvent::ConflictNew(conflict));
        }
    }

    // ========================================================================
    // Progress and await helpers
    // ========================================================================

    /// Current progress projection.
    pub async fn progress(&self) -> Result<SyncProgress> {
        let rows = self.subscriptions_store.list_for_state(&self.config.state_id).await?;
        let state = self.state.lock().clone();
        let bootstraps = self.bootstraps.lock().clone();
        Ok(project_progress(&state, &rows, &bootstraps))
    }

    /// Resolve when the channel reaches `target`; reject on `error` or
    /// timeout.
    pub async fn await_phase(&self, target: ChannelPhase) -> Result<()> {
        self.await_phase_timeout(target, self.config.await_timeout).await
    }

    pub async fn await_phase_timeout(
        &self,
        target: ChannelPhase,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.progress_notify.notified();
            let progress = self.progress().await?;
            if progress.channel_phase == target {
                return Ok(());
            }
            if progress.channel_phase == ChannelPhase::Error {
                let fault = self.state.lock().error.clone();
                return Err(fault.map_or_else(
                    || TidesyncError::Internal("channel entered error phase".into()),
                    fault_into_error,
                ));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TidesyncError::Timeout(format!(
                    "await_phase({target:?}) exceeded {timeout:?}"
                )));
            }
        }
    }

    /// Resolve when no relevant subscription row still carries bootstrap
    /// state.
    pub async fn await_bootstrap_complete(
        &self,
        subscription_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.await_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.progress_notify.notified();
            let rows = self.subscriptions_store.list_for_state(&self.config.state_id).await?;
            let bootstraps = self.bootstraps.lock().clone();
            let busy = rows.iter().any(|row| {
                if let Some(wanted) = subscription_id {
                    if row.subscription_id != wanted {
                        return false;
                    }
                }
                row.bootstrap_state.is_some() || bootstraps.contains_key(&row.subscription_id)
            });
            if !busy {
                return Ok(());
            }
            if let Some(fault) = self.state.lock().error.clone() {
                if !fault.retryable {
                    return Err(fault_into_error(fault));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TidesyncError::Timeout(format!(
                    "await_bootstrap_complete exceeded {timeout:?}"
                )));
            }
        }
    }

    // ========================================================================
    // Reset and repair
    // ========================================================================

    /// Stop the engine and clear replication state in one transaction.
    pub async fn reset(self: &Arc<Self>, options: ResetOptions) -> Result<ResetReport> {
        if options.scope == ResetScope::Subscriptions
            && options.subscription_ids.as_ref().map_or(true, Vec::is_empty)
        {
            return Err(TidesyncError::InvalidInput(
                "reset scope `subscription` requires subscription ids".into(),
            ));
        }

        self.stop().await?;

        let db = Arc::clone(&self.db);
        let registry = Arc::clone(&self.registry);
        let state_id = self.config.state_id.clone();
        let options_blocking = options.clone();

        let report = tokio::task::spawn_blocking(move || -> Result<ResetReport> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let mut report = ResetReport::default();

            let affected = match options_blocking.scope {
                ResetScope::State => subs::list_rows(&tx, &state_id)?,
                ResetScope::All => subs::list_all_rows(&tx)?,
                ResetScope::Subscriptions => {
                    let ids = options_blocking.subscription_ids.clone().unwrap_or_default();
                    subs::list_rows(&tx, &state_id)?
                        .into_iter()
                        .filter(|row| ids.contains(&row.subscription_id))
                        .collect()
                }
            };

            if options_blocking.clear_synced_tables {
                for row in &affected {
                    if registry.contains(&row.table) {
                        registry.get(&row.table)?.clear_all(&tx, &row.scopes)?;
                        if !report.cleared_tables.contains(&row.table) {
                            report.cleared_tables.push(row.table.clone());
                        }
                    }
                }
            }

            for row in &affected {
                if subs::delete_in_tx(&tx, &row.state_id, &row.subscription_id)? {
                    report.deleted_subscription_states += 1;
                }
            }

            if options_blocking.clear_conflicts {
                report.deleted_conflicts = tx
                    .execute("DELETE FROM conflicts", [])
                    .map_err(map_sql_error)? as u64;
            }
            if options_blocking.clear_outbox {
                report.deleted_outbox_commits = tx
                    .execute("DELETE FROM outbox_commits", [])
                    .map_err(map_sql_error)? as u64;
            }

            tx.commit().map_err(map_sql_error)?;
            Ok(report)
        })
        .await
        .map_err(map_join_error)??;

        // In-memory bookkeeping follows the store.
        {
            let mut fingerprints = self.fingerprints.lock();
            for table in &report.cleared_tables {
                fingerprints.clear_table(table);
            }
        }
        self.bootstraps.lock().clear();
        if options.clear_conflicts {
            self.seen_conflicts.lock().clear();
        }
        let pending = self.outbox.pending_count().await.unwrap_or(0);
        self.update_state(|s| s.pending_count = pending);

        if !report.cleared_tables.is_empty() {
            // Dependent views must recompute against the emptied tables.
            self.emit(SyncEvent::DataChange { tables: report.cleared_tables.clone() });
        }
        self.progress_notify.notify_waiters();

        info!(
            subscriptions = report.deleted_subscription_states,
            outbox = report.deleted_outbox_commits,
            conflicts = report.deleted_conflicts,
            "reset completed"
        );
        Ok(report)
    }

    /// The only supported repair mode is `rebootstrap-missing-chunks`:
    /// a reset that clears synced tables so the next sync bootstraps from
    /// scratch.
    pub async fn repair(
        self: &Arc<Self>,
        mode: &str,
        subscription_ids: Option<Vec<String>>,
        clear_outbox: bool,
        clear_conflicts: bool,
    ) -> Result<ResetReport> {
        if mode != "rebootstrap-missing-chunks" {
            return Err(TidesyncError::InvalidInput(format!(
                "unsupported repair mode {mode:?}"
            )));
        }
        let scope = if subscription_ids.is_some() {
            ResetScope::Subscriptions
        } else {
            ResetScope::State
        };
        self.reset(ResetOptions {
            scope,
            subscription_ids,
            clear_outbox,
            clear_conflicts,
            clear_synced_tables: true,
        })
        .await
    }

    // ========================================================================
    // Presence
    // ========================================================================

    /// Join a presence scope: optimistic local update plus a transport
    /// send when the realtime channel is up.
    pub async fn presence_join(
        self: &Arc<Self>,
        scope_key: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let entry = PresenceEntry {
            client_id: self.config.client_id.clone(),
            actor_id: self
                .config
                .actor_id
                .clone()
                .unwrap_or_else(|| self.config.client_id.clone()),
            joined_at: now_ms(),
            metadata: metadata.clone(),
        };
        self.apply_presence_event(PresenceEvent {
            action: PresenceAction::Join,
            scope_key: scope_key.to_string(),
            client_id: Some(entry.client_id.clone()),
            actor_id: Some(entry.actor_id.clone()),
            metadata: metadata.clone(),
            entries: None,
        });

        if let Some(session) = self.realtime_session.lock().await.clone() {
            session.send_presence_join(scope_key, metadata).await?;
        }
        Ok(())
    }

    pub async fn presence_leave(self: &Arc<Self>, scope_key: &str) -> Result<()> {
        self.apply_presence_event(PresenceEvent {
            action: PresenceAction::Leave,
            scope_key: scope_key.to_string(),
            client_id: Some(self.config.client_id.clone()),
            actor_id: None,
            metadata: None,
            entries: None,
        });

        if let Some(session) = self.realtime_session.lock().await.clone() {
            session.send_presence_leave(scope_key).await?;
        }
        Ok(())
    }

    pub async fn presence_update(
        self: &Arc<Self>,
        scope_key: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.apply_presence_event(PresenceEvent {
            action: PresenceAction::Update,
            scope_key: scope_key.to_string(),
            client_id: Some(self.config.client_id.clone()),
            actor_id: None,
            metadata: metadata.clone(),
            entries: None,
        });

        if let Some(session) = self.realtime_session.lock().await.clone() {
            session.send_presence_update(scope_key, metadata).await?;
        }
        Ok(())
    }

    /// Current entries for a presence scope.
    pub fn presence_entries(&self, scope_key: &str) -> Vec<PresenceEntry> {
        self.presence.lock().get(scope_key).cloned().unwrap_or_default()
    }

    /// Mutate the presence map from an event (local or transport).
    /// `presence:change` is emitted only when the stored list actually
    /// changed.
    fn apply_presence_event(&self, event: PresenceEvent) {
        let changed_entries = {
            let mut presence = self.presence.lock();
            let list = presence.entry(event.scope_key.clone()).or_default();
            let before = list.clone();

            match event.action {
                PresenceAction::Snapshot => {
                    *list = event.entries.clone().unwrap_or_default();
                }
                PresenceAction::Join => {
                    if let (Some(client_id), Some(actor_id)) =
                        (event.client_id.clone(), event.actor_id.clone())
                    {
                        match list.iter_mut().find(|e| e.client_id == client_id) {
                            Some(existing) => existing.metadata = event.metadata.clone(),
                            None => list.push(PresenceEntry {
                                client_id,
                                actor_id,
                                joined_at: now_ms(),
                                metadata: event.metadata.clone(),
                            }),
                        }
                    }
                }
                PresenceAction::Leave => {
                    if let Some(client_id) = &event.client_id {
                        list.retain(|e| &e.client_id != client_id);
                    }
                }
                PresenceAction::Update => {
                    if let Some(client_id) = &event.client_id {
                        for entry in list.iter_mut() {
                            if &entry.client_id == client_id {
                                entry.metadata = event.metadata.clone();
                            }
                        }
                    }
                }
            }

            if *list == before {
                None
            } else {
                Some(list.clone())
            }
        };

        if let Some(entries) = changed_entries {
            self.emit(SyncEvent::PresenceChange { scope_key: event.scope_key, entries });
        }
    }

    // ========================================================================
    // State projection, events, and diagnostics
    // ========================================================================

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state.lock().clone()
    }

    /// Current transport health.
    pub fn transport_health(&self) -> TransportHealth {
        let mut health = self.health.lock().clone();
        health.connected = health.connected
            || self.state.lock().connection_state == ConnectionState::Connected;
        health
    }

    /// Subscribe to every engine event.
    pub fn on_event(
        &self,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(listener)
    }

    /// Subscribe to state changes only.
    pub fn subscribe(
        &self,
        listener: impl Fn(&EngineState) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(move |event| {
            if let SyncEvent::StateChange(state) = event {
                listener(state);
            }
        })
    }

    /// Subscribe to a projection of the state; the callback fires only
    /// when the selected value changes.
    pub fn subscribe_selector<T, S, C>(&self, selector: S, listener: C) -> Subscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&EngineState) -> T + Send + Sync + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        let last = Mutex::new(selector(&self.state.lock()));
        self.bus.subscribe(move |event| {
            if let SyncEvent::StateChange(state) = event {
                let value = selector(state);
                let mut last = last.lock();
                if *last != value {
                    listener(&value);
                    *last = value;
                }
            }
        })
    }

    /// Replace the desired subscription set; takes effect on the next
    /// sync.
    pub fn set_subscriptions(&self, specs: Vec<SubscriptionSpec>) {
        *self.desired.lock() = specs;
    }

    /// Fingerprint stamp for one row, if any.
    pub fn fingerprint(&self, table: &str, row_id: &str) -> Option<u64> {
        self.fingerprints.lock().stamp_for(table, row_id)
    }

    /// Bounded ring of recent events for debug UIs.
    pub fn inspector_snapshot(&self) -> Vec<InspectorEntry> {
        self.inspector.lock().snapshot()
    }

    /// One-call diagnostics surface.
    pub async fn diagnostics(&self) -> Result<DiagnosticsSnapshot> {
        let pending = self.outbox.pending_count().await?;
        let failed = self.outbox.count(OutboxStatus::Failed).await?;
        let unresolved = self.conflicts.unresolved_count().await?;
        let rows = self.subscriptions_store.list_for_state(&self.config.state_id).await?;

        Ok(DiagnosticsSnapshot {
            state: self.state(),
            transport_health: self.transport_health(),
            pending_outbox_commits: pending,
            failed_outbox_commits: failed,
            unresolved_conflicts: unresolved,
            subscription_cursors: rows
                .into_iter()
                .map(|row| SubscriptionCursorSummary {
                    subscription_id: row.subscription_id,
                    table: row.table,
                    cursor: row.cursor.max(CURSOR_NONE),
                    bootstrapping: row.bootstrap_state.is_some(),
                })
                .collect(),
        })
    }

    fn update_state<F: FnOnce(&mut EngineState)>(&self, apply: F) {
        let (changed, connection_changed, snapshot) = {
            let mut state = self.state.lock();
            let before = state.clone();
            apply(&mut state);
            let changed = *state != before;
            let connection_changed = state.connection_state != before.connection_state
                || state.transport_mode != before.transport_mode;
            (changed, connection_changed, state.clone())
        };

        if changed {
            if connection_changed {
                self.emit(SyncEvent::ConnectionChange {
                    state: snapshot.connection_state,
                    mode: snapshot.transport_mode,
                });
            }
            self.emit(SyncEvent::StateChange(snapshot));
            self.progress_notify.notify_waiters();
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.inspector.lock().record(&event);
        self.bus.emit(&event);
    }

    /// Emit `data:change`, coalescing rapid mutations within the active
    /// debounce window.
    fn queue_data_change(self: &Arc<Self>, tables: Vec<String>) {
        if tables.is_empty() {
            return;
        }

        let window = {
            let state = self.state.lock();
            if state.connection_state == ConnectionState::Reconnecting {
                self.config.data_change_debounce.while_reconnecting
            } else if state.is_syncing {
                self.config.data_change_debounce.while_syncing
            } else {
                self.config.data_change_debounce.idle
            }
        };

        match window {
            None => self.emit(SyncEvent::DataChange { tables }),
            Some(window) if window.is_zero() => self.emit(SyncEvent::DataChange { tables }),
            Some(window) => {
                let mut debounce = self.debounce.lock();
                debounce.pending.extend(tables);
                if !debounce.timer_running {
                    debounce.timer_running = true;
                    drop(debounce);
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        let tables: Vec<String> = {
                            let mut debounce = engine.debounce.lock();
                            debounce.timer_running = false;
                            std::mem::take(&mut debounce.pending).into_iter().collect()
                        };
                        if !tables.is_empty() {
                            engine.emit(SyncEvent::DataChange { tables });
                        }
                    });
                }
            }
        }
    }
}

/// Rebuild a domain error from a classified fault (for coalesced sync
/// waiters and await helpers).
pub(crate) fn fault_into_error(fault: SyncFault) -> TidesyncError {
    match fault.code {
        SyncErrorCode::NetworkError
        | SyncErrorCode::AuthFailed
        | SyncErrorCode::SnapshotChunkNotFound => TidesyncError::Transport {
            message: fault.message,
            status: fault.http_status,
        },
        SyncErrorCode::MigrationFailed => TidesyncError::Migration(fault.message),
        SyncErrorCode::Conflict
        | SyncErrorCode::SyncError
        | SyncErrorCode::Unknown => TidesyncError::Internal(fault.message),
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;
    use tidesync_domain::{PullResponse, SyncResponse};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::database::manager::test_support;
    use crate::database::schema_handler::{ColumnSpec, TableSchema};
    use crate::database::{SqliteConflictStore, SqliteOutboxRepository, SqliteSubscriptionStore};

    struct ScriptedTransport {
        responses: AsyncMutex<Vec<Result<SyncResponse>>>,
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn sync(&self, _request: SyncRequest) -> Result<SyncResponse> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok(SyncResponse {
                    push: None,
                    pull: Some(PullResponse { ok: true, subscriptions: Vec::new() }),
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn build_engine(
        responses: Vec<Result<SyncResponse>>,
    ) -> (Arc<SyncEngine>, tempfile::TempDir) {
        let (db, dir) = test_support::manager();
        {
            let conn = db.get_connection().unwrap();
            conn.execute_batch(
                "CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT, row_version INTEGER)",
            )
            .unwrap();
        }

        let schema = Arc::new(
            TableSchema::new("items", vec![ColumnSpec::new("name")])
                .with_version_column("row_version"),
        );
        let handler = Arc::new(SchemaTableHandler::new(schema).unwrap());
        let mut registry = TableRegistry::new();
        registry.register("items", Arc::clone(&handler) as _).unwrap();
        let mut schemas = HashMap::new();
        schemas.insert("items".to_string(), handler);

        let mut config = SyncEngineConfig::new("client-1", "profile-1");
        // Synchronous data:change keeps the tests deterministic.
        config.data_change_debounce =
            DataChangeDebounce { idle: None, while_syncing: None, while_reconnecting: None };

        let engine = SyncEngine::new(
            config,
            SyncEngineDeps {
                db: Arc::clone(&db),
                registry: Arc::new(registry),
                schemas,
                outbox: Arc::new(SqliteOutboxRepository::new(Arc::clone(&db))),
                subscriptions_store: Arc::new(SqliteSubscriptionStore::new(Arc::clone(&db))),
                conflicts: Arc::new(SqliteConflictStore::new(Arc::clone(&db))),
                transport: Arc::new(ScriptedTransport { responses: AsyncMutex::new(responses) }),
                plugins: Vec::new(),
                migration_runner: None,
                subscriptions: vec![SubscriptionSpec::new("sub-1", "items")],
            },
        )
        .unwrap();

        (engine, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_sync_clears_error_and_retry_state() {
        let (engine, _dir) = build_engine(vec![]);
        // Enable without timers so the scripted responses stay with the
        // explicit sync calls.
        engine.update_state(|s| s.enabled = true);

        let report = engine.sync().await.expect("sync succeeds");
        assert_eq!(report.pushed, 0);

        let state = engine.state();
        assert!(state.enabled);
        assert!(!state.is_syncing);
        assert!(state.last_sync_at.is_some());
        assert!(state.error.is_none());
        assert_eq!(state.retry_count, 0);
        assert!(!state.is_retrying);
        assert_eq!(state.connection_state, ConnectionState::Connected);

        engine.destroy().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retryable_failure_classifies_and_schedules_retry() {
        let (engine, _dir) = build_engine(vec![
            Err(TidesyncError::transport_status("HTTP 429 Too Many Requests", 429)),
        ]);
        engine.update_state(|s| s.enabled = true);

        let err = engine.sync().await.expect_err("sync fails");
        assert!(matches!(err, TidesyncError::Transport { status: Some(429), .. }));

        let state = engine.state();
        let fault = state.error.expect("fault recorded");
        assert_eq!(fault.code, SyncErrorCode::NetworkError);
        assert!(fault.retryable);
        assert_eq!(state.retry_count, 1);
        assert!(state.is_retrying, "a retry must be scheduled");

        engine.destroy().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_retryable_failure_does_not_schedule() {
        let (engine, _dir) = build_engine(vec![
            Err(TidesyncError::transport_status("HTTP 401 Unauthorized", 401)),
        ]);
        engine.update_state(|s| s.enabled = true);

        engine.sync().await.expect_err("sync fails");

        let state = engine.state();
        assert_eq!(state.error.as_ref().map(|f| f.code), Some(SyncErrorCode::AuthFailed));
        assert!(!state.is_retrying);

        engine.destroy().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroyed_engine_cannot_restart() {
        let (engine, _dir) = build_engine(vec![]);
        engine.start().await.unwrap();
        engine.destroy().await.unwrap();

        let err = engine.start().await.expect_err("restart must fail");
        assert!(matches!(err, TidesyncError::Lifecycle(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_change_events_fire_only_on_actual_change() {
        let (engine, _dir) = build_engine(vec![]);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let _sub = engine.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        engine.update_state(|s| s.pending_count = 3);
        engine.update_state(|s| s.pending_count = 3); // no-op
        engine.update_state(|s| s.pending_count = 4);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn selector_subscription_fires_on_projection_change_only() {
        let (engine, _dir) = build_engine(vec![]);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let _sub = engine.subscribe_selector(
            |state| state.pending_count,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        engine.update_state(|s| s.pending_count = 1);
        engine.update_state(|s| {
            s.pending_count = 1;
            s.is_syncing = true; // state changes, projection does not
        });
        engine.update_state(|s| s.pending_count = 2);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutate_records_rows_and_emits_events() {
        let (engine, _dir) = build_engine(vec![]);
        let data_changes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&data_changes);
        let _sub = engine.on_event(move |event| {
            if matches!(event, SyncEvent::DataChange { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let receipt = engine
            .mutate(
                vec![Operation::upsert("items", "row-1", json!({"name": "A"}))],
                MutationOptions::default(),
            )
            .await
            .expect("mutate");
        assert!(!receipt.client_commit_id.is_empty());

        assert_eq!(data_changes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state().pending_count, 1);
        assert!(engine.fingerprint("items", "row-1").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn presence_noop_updates_are_suppressed() {
        let (engine, _dir) = build_engine(vec![]);
        let changes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&changes);
        let _sub = engine.on_event(move |event| {
            if matches!(event, SyncEvent::PresenceChange { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let join = PresenceEvent {
            action: PresenceAction::Join,
            scope_key: "doc:1".into(),
            client_id: Some("c1".into()),
            actor_id: Some("a1".into()),
            metadata: None,
            entries: None,
        };
        engine.apply_presence_event(join.clone());
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        // Re-joining with identical metadata changes nothing.
        engine.apply_presence_event(join);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        // Snapshot replaces the list wholesale.
        engine.apply_presence_event(PresenceEvent {
            action: PresenceAction::Snapshot,
            scope_key: "doc:1".into(),
            client_id: None,
            actor_id: None,
            metadata: None,
            entries: Some(vec![PresenceEntry {
                client_id: "c2".into(),
                actor_id: "a2".into(),
                joined_at: 1,
                metadata: None,
            }]),
        });
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(engine.presence_entries("doc:1").len(), 1);
        assert_eq!(engine.presence_entries("doc:1")[0].client_id, "c2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repair_rejects_unknown_modes() {
        let (engine, _dir) = build_engine(vec![]);
        let err = engine
            .repair("resurrect-everything", None, false, false)
            .await
            .expect_err("unknown mode");
        assert!(matches!(err, TidesyncError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inspector_records_emitted_events() {
        let (engine, _dir) = build_engine(vec![]);
        engine.emit(SyncEvent::SyncStart);
        engine.emit(SyncEvent::OutboxChange { pending: 2 });

        let snapshot = engine.inspector_snapshot();
        assert!(snapshot.len() >= 2);
        let names: Vec<&str> = snapshot.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"sync:start"));
        assert!(names.contains(&"outbox:change"));
    }
}
