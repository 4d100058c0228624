//! Delta-sync coordination.
//!
//! A coordinator keeps one query's local view convergent with the
//! server across connectivity loss and process restarts. Each sync
//! cycle serves the cached view immediately, connects the live
//! subscription, then catches up over the network, choosing between
//! the full base query and the cheap delta query by how stale the
//! recorded last-sync time is.
//!
//! Messages arriving on the live subscription while a cycle is in
//! progress are buffered and drained in arrival order once the cycle
//! settles, so a message is never applied ahead of the query result it
//! postdates and is never dropped or delivered twice.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tidesync_cache::NormalizedCache;
use tidesync_protocol::{
    Fingerprint, Operation, OperationKind, QueryResponse, SubscriptionMessage,
};
use tracing::{debug, info, warn};

use crate::backoff::{retry_delay, RetryStrategy};
use crate::error::{EngineError, EngineResult};
use crate::events::{ClientEvent, EventBus};
use crate::metadata::SyncMetadataStore;
use crate::mux::{SubscriptionMultiplexer, TopicWatcher, WatcherId};
use crate::transport::Transport;

/// Last-sync timestamps are recorded slightly in the past so that a
/// write landing between query execution and timestamp recording is
/// still covered by the next delta.
const CLOCK_SKEW: Duration = Duration::from_secs(2);

/// Default staleness threshold beyond which a full base query replaces
/// the delta query.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(86_400);

/// Cache key under which the root of the base query's result graph is
/// stored.
pub const QUERY_ROOT: &str = "QUERY_ROOT";

/// Variable name the delta query is parameterized with: the last-sync
/// time in epoch seconds.
pub const LAST_SYNC_VARIABLE: &str = "lastSync";

/// Observable lifecycle of a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Subscription live and queries up to date.
    Active,
    /// Connectivity interrupted; recovery is automatic.
    Interrupted,
    /// The last cycle failed; a retry is scheduled.
    Failed(String),
    /// Unrecoverable failure. Terminal.
    Terminated(String),
    /// Cancelled by the caller. Terminal.
    Cancelled,
}

impl SyncState {
    /// Whether the session will never attempt another cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Terminated(_) | SyncState::Cancelled)
    }
}

/// Where a base query result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// Served locally from the normalized cache.
    Cache,
    /// Fetched over the network.
    Network,
}

/// A delivery on the session's subscription channel.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A live (or drained-from-buffer) message.
    Message(SubscriptionMessage),
    /// The subscription dropped; the session recovers on its own. Not
    /// terminal, unlike [`SyncState::Terminated`].
    Interrupted {
        /// What went wrong.
        reason: String,
    },
}

/// Callbacks a sync session's owner registers at construction.
///
/// All callbacks are invoked from the coordinator's task. After
/// [`DeltaSyncCoordinator::cancel`] no further callbacks are initiated;
/// one already executing when cancel lands may still complete.
pub trait SyncHandler: Send + Sync {
    /// A base query result, from cache or network.
    fn on_base_result(&self, result: EngineResult<QueryResponse>, source: ResultSource);

    /// A delta query result.
    fn on_delta_result(&self, result: EngineResult<QueryResponse>);

    /// A subscription delivery.
    fn on_subscription_event(&self, event: SubscriptionEvent);

    /// The session's state changed. Default: ignored.
    fn on_state_change(&self, state: &SyncState) {
        let _ = state;
    }
}

/// The query trio a session synchronizes.
#[derive(Debug, Clone)]
pub struct SyncSession {
    /// Full refetch of the synchronized view.
    pub base: Operation,
    /// Incremental catch-up since a known time; optional.
    pub delta: Option<Operation>,
    /// Live change feed; optional.
    pub subscription: Option<Operation>,
}

impl SyncSession {
    /// A session that only ever runs the base query.
    pub fn base_only(base: Operation) -> Self {
        Self { base, delta: None, subscription: None }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.base.kind != OperationKind::Query {
            return Err(EngineError::Configuration(format!(
                "base operation {} must be a query",
                self.base.name
            )));
        }
        if let Some(delta) = &self.delta {
            if delta.kind != OperationKind::Query {
                return Err(EngineError::Configuration(format!(
                    "delta operation {} must be a query",
                    delta.name
                )));
            }
        }
        if let Some(subscription) = &self.subscription {
            if subscription.kind != OperationKind::Subscription {
                return Err(EngineError::Configuration(format!(
                    "operation {} must be a subscription",
                    subscription.name
                )));
            }
        }
        Ok(())
    }
}

/// Tuning for a sync session.
#[derive(Debug, Clone, Copy)]
pub struct SyncSessionConfig {
    /// Staleness threshold for preferring base over delta.
    pub sync_interval: Duration,
    /// Backoff strategy between failed cycles.
    pub retry_strategy: RetryStrategy,
}

impl Default for SyncSessionConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry_strategy: RetryStrategy::Exponential,
        }
    }
}

enum WatcherEventKind {
    Connected,
    Failed(String),
    Disconnected,
    Message {
        message: SubscriptionMessage,
        received_at: SystemTime,
    },
}

struct WatcherEvent {
    epoch: u64,
    kind: WatcherEventKind,
}

/// Bridges multiplexer callbacks onto the coordinator's event channel.
/// Events from superseded registrations are told apart by epoch.
struct CoordinatorWatcher {
    epoch: u64,
    sender: mpsc::UnboundedSender<WatcherEvent>,
}

impl CoordinatorWatcher {
    fn send(&self, kind: WatcherEventKind) {
        let _ = self.sender.send(WatcherEvent { epoch: self.epoch, kind });
    }
}

impl TopicWatcher for CoordinatorWatcher {
    fn on_connected(&self) {
        self.send(WatcherEventKind::Connected);
    }

    fn on_disconnected(&self) {
        self.send(WatcherEventKind::Disconnected);
    }

    fn on_error(&self, error: &EngineError) {
        self.send(WatcherEventKind::Failed(error.to_string()));
    }

    fn on_message(&self, message: &SubscriptionMessage) {
        self.send(WatcherEventKind::Message {
            message: message.clone(),
            received_at: SystemTime::now(),
        });
    }
}

struct CycleFailure {
    reason: String,
    interrupted: bool,
    /// Retrying cannot help (authentication, client errors); the
    /// session terminates instead of rescheduling.
    terminal: bool,
}

impl CycleFailure {
    fn recoverable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            interrupted: false,
            terminal: false,
        }
    }

    fn interrupted(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            interrupted: true,
            terminal: false,
        }
    }

    fn from_error(error: &EngineError) -> Self {
        Self {
            reason: error.to_string(),
            interrupted: false,
            terminal: !error.is_retryable(),
        }
    }
}

struct CoordInner {
    session: SyncSession,
    fingerprint: Fingerprint,
    topic: Option<String>,
    handler: Arc<dyn SyncHandler>,
    cache: Arc<dyn NormalizedCache>,
    metadata: SyncMetadataStore,
    transport: Arc<dyn Transport>,
    mux: SubscriptionMultiplexer,
    config: SyncSessionConfig,
    state: Mutex<SyncState>,
    watcher_id: Mutex<Option<WatcherId>>,
    events_tx: mpsc::UnboundedSender<WatcherEvent>,
    resync: tokio::sync::Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU32,
    cancelled: AtomicBool,
}

impl CoordInner {
    fn set_state(&self, next: SyncState) {
        let changed = {
            let mut state = self.state.lock();
            if *state == next {
                false
            } else {
                *state = next.clone();
                true
            }
        };
        if changed {
            debug!(state = ?next, "sync state changed");
            self.handler.on_state_change(&next);
        }
    }
}

/// Runs one sync session until cancelled.
pub struct DeltaSyncCoordinator {
    inner: Arc<CoordInner>,
    run_task: JoinHandle<()>,
    bus_task: JoinHandle<()>,
}

impl DeltaSyncCoordinator {
    /// Starts a session. The first cycle begins immediately.
    ///
    /// Must be called within a Tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        session: SyncSession,
        handler: Arc<dyn SyncHandler>,
        cache: Arc<dyn NormalizedCache>,
        metadata: SyncMetadataStore,
        transport: Arc<dyn Transport>,
        mux: SubscriptionMultiplexer,
        bus: &EventBus,
        config: SyncSessionConfig,
    ) -> EngineResult<Self> {
        session.validate()?;
        let fingerprint = Fingerprint::of_session(
            &session.base,
            session.delta.as_ref(),
            session.subscription.as_ref(),
        );
        let topic = session
            .subscription
            .as_ref()
            .map(|op| Fingerprint::of_operation(op).as_str().to_owned());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(CoordInner {
            session,
            fingerprint,
            topic,
            handler,
            cache,
            metadata,
            transport,
            mux,
            config,
            state: Mutex::new(SyncState::Active),
            watcher_id: Mutex::new(None),
            events_tx,
            resync: tokio::sync::Notify::new(),
            timer: Mutex::new(None),
            attempts: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        });

        info!(fingerprint = %inner.fingerprint, "starting sync session");
        let run_task = tokio::spawn(Self::run(Arc::clone(&inner), events_rx));
        let bus_task = tokio::spawn(Self::watch_bus(Arc::clone(&inner), bus.subscribe()));
        Ok(Self { inner, run_task, bus_task })
    }

    /// The session's identity fingerprint.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    /// The topic of the session's subscription, if it has one.
    pub fn topic(&self) -> Option<&str> {
        self.inner.topic.as_deref()
    }

    /// Current session state.
    pub fn state(&self) -> SyncState {
        self.inner.state.lock().clone()
    }

    /// Requests an out-of-band sync cycle. If a cycle is in progress
    /// the request is deferred, not dropped; multiple requests collapse
    /// into one follow-up cycle.
    pub fn request_sync(&self) {
        self.inner.resync.notify_one();
    }

    /// Cancels the session. Terminal and idempotent. No further
    /// handler callbacks are initiated; a callback already running on
    /// the session task when this lands may still complete.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(fingerprint = %self.inner.fingerprint, "cancelling sync session");
        self.run_task.abort();
        self.bus_task.abort();
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        if let Some(id) = self.inner.watcher_id.lock().take() {
            self.inner.mux.remove_watcher(id);
        }
        *self.inner.state.lock() = SyncState::Cancelled;
    }

    async fn watch_bus(
        inner: Arc<CoordInner>,
        mut receiver: tokio::sync::broadcast::Receiver<ClientEvent>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(ClientEvent::ReachabilityChanged { reachable: true })
                | Ok(ClientEvent::EnteredForeground) => {
                    debug!("retriggering sync from client event");
                    inner.resync.notify_one();
                }
                Ok(ClientEvent::ReachabilityChanged { reachable: false }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn run(inner: Arc<CoordInner>, mut events: mpsc::UnboundedReceiver<WatcherEvent>) {
        let mut epoch = 0u64;
        loop {
            epoch += 1;
            let result = Self::run_cycle(&inner, &mut events, epoch).await;
            let delay = match result {
                Ok(()) => {
                    inner.attempts.store(0, Ordering::SeqCst);
                    inner.set_state(SyncState::Active);
                    inner.config.sync_interval
                }
                Err(failure) if failure.terminal => {
                    warn!(reason = %failure.reason, "sync session terminated");
                    inner.set_state(SyncState::Terminated(failure.reason));
                    if let Some(id) = inner.watcher_id.lock().take() {
                        inner.mux.remove_watcher(id);
                    }
                    return;
                }
                Err(failure) => {
                    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let state = if failure.interrupted {
                        SyncState::Interrupted
                    } else {
                        SyncState::Failed(failure.reason.clone())
                    };
                    inner.set_state(state);
                    let delay = retry_delay(inner.config.retry_strategy, attempt);
                    warn!(reason = %failure.reason, attempt,
                          delay_ms = delay.as_millis() as u64,
                          "sync cycle failed; retry scheduled");
                    delay
                }
            };
            Self::arm_timer(&inner, delay);

            // Live mode: deliver messages immediately until something
            // requests the next cycle.
            loop {
                tokio::select! {
                    _ = inner.resync.notified() => break,
                    event = events.recv() => match event {
                        Some(event) => Self::handle_live_event(&inner, event, epoch),
                        None => return,
                    },
                }
            }
        }
    }

    fn arm_timer(inner: &Arc<CoordInner>, delay: Duration) {
        let timer_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("sync timer fired");
            timer_inner.resync.notify_one();
        });
        if let Some(previous) = inner.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_live_event(inner: &Arc<CoordInner>, event: WatcherEvent, epoch: u64) {
        match event.kind {
            WatcherEventKind::Message { message, received_at } => {
                Self::apply_message(inner, message, received_at);
            }
            WatcherEventKind::Failed(reason) if event.epoch == epoch => {
                inner.set_state(SyncState::Interrupted);
                inner
                    .handler
                    .on_subscription_event(SubscriptionEvent::Interrupted { reason });
            }
            WatcherEventKind::Disconnected if event.epoch == epoch => {
                inner.set_state(SyncState::Interrupted);
                inner.handler.on_subscription_event(SubscriptionEvent::Interrupted {
                    reason: "subscription disconnected".to_owned(),
                });
            }
            // Stale registrations and duplicate connects are inert.
            _ => {}
        }
    }

    /// Applies one live message: cache first, then the handler, then
    /// the last-sync time so a crash between steps re-delivers rather
    /// than skips.
    fn apply_message(inner: &Arc<CoordInner>, message: SubscriptionMessage, received_at: SystemTime) {
        if !message.records.is_empty() {
            if let Err(err) = inner.cache.merge(message.records.clone()) {
                warn!(error = %err, "failed to merge subscription records");
            }
        }
        inner
            .handler
            .on_subscription_event(SubscriptionEvent::Message(message));
        if let Err(err) = inner
            .metadata
            .set_last_sync(&inner.fingerprint, received_at - CLOCK_SKEW)
        {
            warn!(error = %err, "failed to record last-sync time");
        }
    }

    async fn run_cycle(
        inner: &Arc<CoordInner>,
        events: &mut mpsc::UnboundedReceiver<WatcherEvent>,
        epoch: u64,
    ) -> Result<(), CycleFailure> {
        debug!(epoch, "sync cycle starting");

        // 1. Serve the cached view without touching the network.
        Self::serve_cached_base(inner);

        // 2. (Re)connect the subscription and wait for its ack,
        //    buffering any messages that race in.
        let mut buffered: Vec<(SubscriptionMessage, SystemTime)> = Vec::new();
        let connect_result = Self::connect_subscription(inner, events, epoch, &mut buffered).await;

        // 3. Catch up over the network, base or delta.
        let query_result = match &connect_result {
            Ok(()) => Self::catch_up(inner).await,
            // No point querying into a dead cycle; skip to the drain.
            Err(_) => Ok(()),
        };

        // 4-5. Drain buffered messages in arrival order, exactly once,
        //      on success and failure alike.
        for (message, received_at) in buffered {
            Self::apply_message(inner, message, received_at);
        }
        while let Ok(event) = events.try_recv() {
            Self::handle_live_event(inner, event, epoch);
        }

        connect_result.and(query_result)
    }

    fn serve_cached_base(inner: &Arc<CoordInner>) {
        match inner.cache.resolve(QUERY_ROOT) {
            Ok(records) if !records.is_empty() => {
                debug!(records = records.len(), "serving base result from cache");
                inner.handler.on_base_result(
                    Ok(QueryResponse::new(Value::Null).with_records(records)),
                    ResultSource::Cache,
                );
            }
            Ok(_) => debug!("no cached base result to serve"),
            Err(err) => warn!(error = %err, "failed to read cached base result"),
        }
    }

    async fn connect_subscription(
        inner: &Arc<CoordInner>,
        events: &mut mpsc::UnboundedReceiver<WatcherEvent>,
        epoch: u64,
        buffered: &mut Vec<(SubscriptionMessage, SystemTime)>,
    ) -> Result<(), CycleFailure> {
        let Some(topic) = inner.topic.clone() else {
            return Ok(());
        };
        if let Some(previous) = inner.watcher_id.lock().take() {
            inner.mux.remove_watcher(previous);
        }
        let watcher = Arc::new(CoordinatorWatcher {
            epoch,
            sender: inner.events_tx.clone(),
        });
        let id = inner.mux.add_watcher(watcher, vec![topic.clone()]);
        *inner.watcher_id.lock() = Some(id);

        loop {
            let Some(event) = events.recv().await else {
                return Err(CycleFailure::recoverable("event channel closed"));
            };
            match event.kind {
                WatcherEventKind::Message { message, received_at } => {
                    buffered.push((message, received_at));
                }
                WatcherEventKind::Connected if event.epoch == epoch => {
                    debug!(topic, "subscription connected");
                    return Ok(());
                }
                WatcherEventKind::Failed(reason) if event.epoch == epoch => {
                    return Err(CycleFailure::interrupted(reason));
                }
                // Stale events from a superseded registration.
                _ => {}
            }
        }
    }

    async fn catch_up(inner: &Arc<CoordInner>) -> Result<(), CycleFailure> {
        let last = match inner.metadata.last_sync(&inner.fingerprint) {
            Ok(last) => last,
            Err(err) => {
                return Err(CycleFailure::recoverable(format!(
                    "last-sync lookup failed: {err}"
                )))
            }
        };
        let use_base = match (&inner.session.delta, last) {
            (None, _) | (_, None) => true,
            (Some(_), Some(last)) => {
                let staleness = SystemTime::now()
                    .duration_since(last)
                    .unwrap_or_default();
                staleness >= inner.config.sync_interval
            }
        };

        let started = SystemTime::now();
        if use_base {
            debug!(name = %inner.session.base.name, "running base query");
            match inner.transport.execute_query(&inner.session.base).await {
                Ok(response) => {
                    Self::merge_records(inner, &response)?;
                    inner
                        .handler
                        .on_base_result(Ok(response), ResultSource::Network);
                }
                Err(err) => {
                    let failure = CycleFailure::from_error(&err);
                    inner.handler.on_base_result(Err(err), ResultSource::Network);
                    return Err(failure);
                }
            }
        } else {
            // `last` is Some on this branch by construction.
            let last = last.unwrap_or(UNIX_EPOCH);
            let delta = inner
                .session
                .delta
                .clone()
                .map(|op| op.with_variable(LAST_SYNC_VARIABLE, epoch_seconds(last)));
            let Some(delta) = delta else {
                return Ok(());
            };
            debug!(name = %delta.name, "running delta query");
            match inner.transport.execute_query(&delta).await {
                Ok(response) => {
                    Self::merge_records(inner, &response)?;
                    inner.handler.on_delta_result(Ok(response));
                }
                Err(err) => {
                    let failure = CycleFailure::from_error(&err);
                    inner.handler.on_delta_result(Err(err));
                    return Err(failure);
                }
            }
        }

        if let Err(err) = inner
            .metadata
            .set_last_sync(&inner.fingerprint, started - CLOCK_SKEW)
        {
            warn!(error = %err, "failed to record last-sync time");
        }
        Ok(())
    }

    fn merge_records(inner: &Arc<CoordInner>, response: &QueryResponse) -> Result<(), CycleFailure> {
        if response.records.is_empty() {
            return Ok(());
        }
        match inner.cache.merge(response.records.clone()) {
            Ok(changed) => {
                debug!(changed = changed.len(), "merged query records");
                Ok(())
            }
            Err(err) => Err(CycleFailure::recoverable(format!(
                "cache merge failed: {err}"
            ))),
        }
    }
}

impl Drop for DeltaSyncCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
