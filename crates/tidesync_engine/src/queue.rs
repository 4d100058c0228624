//! Durable mutation queue.
//!
//! Writes are accepted locally, persisted before `enqueue` returns, and
//! delivered to the transport strictly one at a time in queue order.
//! A record outlives the process: on reopen, persisted mutations are
//! reloaded in their stored order ahead of anything enqueued later.
//!
//! Completion semantics: a mutation's result handler fires exactly once
//! for a terminal outcome, or never if the mutation was cancelled first.
//! Retryable transport failures are retried in place with backoff; the
//! head of the queue never loses its turn to a retry. The retries end
//! once the backoff would pass
//! [`MAX_RETRY_WAIT`](crate::backoff::MAX_RETRY_WAIT): the failure
//! goes terminal and the mutations behind it get their turn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tidesync_protocol::{AttachmentDescriptor, ConflictState, MutationResponse, Operation};
use tidesync_store::KeyValueTable;
use tracing::{debug, error, info, warn};

use crate::backoff::{RetryHandler, RetryStrategy};
use crate::error::{EngineError, EngineResult};
use crate::events::{ClientEvent, EventBus};
use crate::transport::Transport;

/// Scheduling class of a queued mutation.
///
/// High-priority mutations are inserted ahead of normal ones but behind
/// earlier high-priority ones; within a class, order is first-in
/// first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MutationPriority {
    /// Jumps ahead of all queued normal-priority mutations.
    High,
    /// Appended after everything already queued.
    #[default]
    Normal,
}

impl MutationPriority {
    fn key_code(self) -> u8 {
        match self {
            MutationPriority::High => 0,
            MutationPriority::Normal => 1,
        }
    }
}

/// Lifecycle state of a persisted mutation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Waiting for its turn.
    Queued,
    /// Handed to the transport. A record found in this state on reopen
    /// crashed mid-flight and is re-queued.
    Executing,
}

/// The persisted form of a queued mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Stable identity, assigned at enqueue time.
    pub id: Uuid,
    /// The operation to execute.
    pub operation: Operation,
    /// Scheduling class.
    pub priority: MutationPriority,
    /// Lifecycle state.
    pub state: RecordState,
    /// Monotonic sequence within this queue's store.
    pub seq: u64,
    /// Enqueue wall-clock time, epoch milliseconds.
    pub created_at_ms: u64,
    /// Out-of-band upload associated with this mutation, replayed
    /// opaquely by the integration layer.
    pub attachment: Option<AttachmentDescriptor>,
}

fn record_key(priority: MutationPriority, seq: u64) -> String {
    format!("{}:{seq:016x}", priority.key_code())
}

/// Resolves a rejected conditional write.
///
/// Called from the queue's run loop while the queue is paused on the
/// conflicted mutation, so implementations should return promptly.
pub trait ConflictHook: Send + Sync {
    /// Produces a replacement mutation from the server's state, or
    /// `None` to abandon the write.
    fn resolve(&self, server_state: &ConflictState) -> Option<Operation>;
}

/// Callback invoked with a mutation's terminal outcome.
pub type MutationResultHandler = Box<dyn FnOnce(EngineResult<MutationResponse>) + Send>;

/// A mutation submitted for enqueueing.
pub struct MutationRequest {
    operation: Operation,
    priority: MutationPriority,
    attachment: Option<AttachmentDescriptor>,
    conflict_hook: Option<Arc<dyn ConflictHook>>,
    on_result: Option<MutationResultHandler>,
}

impl MutationRequest {
    /// Creates a normal-priority request with no callbacks.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            priority: MutationPriority::Normal,
            attachment: None,
            conflict_hook: None,
            on_result: None,
        }
    }

    /// Sets the scheduling class.
    #[must_use]
    pub fn with_priority(mut self, priority: MutationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Associates an out-of-band upload descriptor.
    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentDescriptor) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Installs a conflict resolution hook.
    #[must_use]
    pub fn with_conflict_hook(mut self, hook: Arc<dyn ConflictHook>) -> Self {
        self.conflict_hook = Some(hook);
        self
    }

    /// Installs a terminal-outcome handler.
    #[must_use]
    pub fn on_result(
        mut self,
        handler: impl FnOnce(EngineResult<MutationResponse>) + Send + 'static,
    ) -> Self {
        self.on_result = Some(Box::new(handler));
        self
    }
}

/// Tuning for a [`MutationQueue`].
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Whether the queue starts draining immediately.
    pub start_online: bool,
    /// Whether a reachability-restored event resumes a paused queue.
    pub auto_resubmit: bool,
    /// Backoff strategy for retryable execution failures.
    pub retry_strategy: RetryStrategy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            start_online: true,
            auto_resubmit: true,
            retry_strategy: RetryStrategy::Exponential,
        }
    }
}

struct PendingMutation {
    record: MutationRecord,
    hook: Option<Arc<dyn ConflictHook>>,
    handler: Option<MutationResultHandler>,
}

struct QueueState {
    pending: VecDeque<PendingMutation>,
    online: bool,
    executing: Option<Uuid>,
    /// The in-flight mutation was cancelled; suppress its handler.
    cancel_executing: bool,
    shutdown: bool,
    next_seq: u64,
}

struct QueueShared {
    table: Arc<dyn KeyValueTable>,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Durable, single-writer FIFO of mutations.
pub struct MutationQueue {
    shared: Arc<QueueShared>,
    config: QueueConfig,
    run_task: JoinHandle<()>,
    bus_task: JoinHandle<()>,
}

/// Handle to a queued mutation, used for cancellation.
#[derive(Clone)]
pub struct MutationHandle {
    id: Uuid,
    shared: Arc<QueueShared>,
}

impl MutationHandle {
    /// The mutation's stable identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancels the mutation.
    ///
    /// A still-queued mutation is removed from queue and store and its
    /// handler never fires. A mutation already handed to the transport
    /// cannot be recalled; its handler is suppressed instead. After a
    /// terminal outcome this is a no-op. Idempotent.
    pub fn cancel(&self) {
        let removed_key = {
            let mut state = self.shared.state.lock();
            if state.executing == Some(self.id) {
                state.cancel_executing = true;
                debug!(id = %self.id, "cancelled in-flight mutation; outcome suppressed");
                None
            } else if let Some(pos) = state
                .pending
                .iter()
                .position(|p| p.record.id == self.id)
            {
                let pending = state.pending.remove(pos).expect("position just found");
                debug!(id = %self.id, "cancelled queued mutation");
                Some(record_key(pending.record.priority, pending.record.seq))
            } else {
                None
            }
        };
        if let Some(key) = removed_key {
            if let Err(err) = self.shared.table.delete(&key) {
                warn!(id = %self.id, error = %err, "failed to delete cancelled record");
            }
        }
    }
}

impl MutationQueue {
    /// Opens a queue over `table`, reloading any persisted mutations in
    /// their stored order, and starts its run loop.
    ///
    /// Reloaded mutations carry no handlers or hooks; those cannot
    /// outlive the process that registered them. Must be called within
    /// a Tokio runtime.
    pub fn open(
        table: Arc<dyn KeyValueTable>,
        transport: Arc<dyn Transport>,
        bus: &EventBus,
        config: QueueConfig,
    ) -> EngineResult<Self> {
        let mut pending = VecDeque::new();
        let mut next_seq = 0u64;
        let mut stale_keys = Vec::new();
        for (key, value) in table.scan()? {
            match ciborium::from_reader::<MutationRecord, _>(value.as_slice()) {
                Ok(mut record) => {
                    next_seq = next_seq.max(record.seq + 1);
                    record.state = RecordState::Queued;
                    pending.push_back(PendingMutation {
                        record,
                        hook: None,
                        handler: None,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "dropping undecodable mutation record");
                    stale_keys.push(key);
                }
            }
        }
        for key in stale_keys {
            table.delete(&key)?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "reloaded persisted mutations");
        }

        let shared = Arc::new(QueueShared {
            table,
            state: Mutex::new(QueueState {
                pending,
                online: config.start_online,
                executing: None,
                cancel_executing: false,
                shutdown: false,
                next_seq,
            }),
            wake: Notify::new(),
        });

        let run_task = tokio::spawn(Self::run(
            Arc::clone(&shared),
            transport,
            config.retry_strategy,
        ));
        let bus_task = tokio::spawn(Self::watch_bus(
            Arc::clone(&shared),
            bus.subscribe(),
            config.auto_resubmit,
        ));

        Ok(Self {
            shared,
            config,
            run_task,
            bus_task,
        })
    }

    /// Enqueues a mutation. The record is persisted before this
    /// returns; a persistence failure rejects the enqueue and nothing
    /// is scheduled.
    pub fn enqueue(&self, request: MutationRequest) -> EngineResult<MutationHandle> {
        let MutationRequest {
            operation,
            priority,
            attachment,
            conflict_hook,
            on_result,
        } = request;

        let record = {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            MutationRecord {
                id: Uuid::new_v4(),
                operation,
                priority,
                state: RecordState::Queued,
                seq,
                created_at_ms: epoch_millis(SystemTime::now()),
                attachment,
            }
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&record, &mut bytes)
            .map_err(|err| EngineError::Protocol(format!("record encode failed: {err}")))?;
        self.shared
            .table
            .put(&record_key(record.priority, record.seq), &bytes)?;

        let id = record.id;
        {
            let mut state = self.shared.state.lock();
            let pending = PendingMutation {
                record,
                hook: conflict_hook,
                handler: on_result,
            };
            let pos = match pending.record.priority {
                MutationPriority::Normal => state.pending.len(),
                MutationPriority::High => state
                    .pending
                    .iter()
                    .position(|p| p.record.priority == MutationPriority::Normal)
                    .unwrap_or(state.pending.len()),
            };
            state.pending.insert(pos, pending);
        }
        debug!(%id, "mutation enqueued");
        self.shared.wake.notify_one();
        Ok(MutationHandle {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Pauses or resumes delivery. An in-flight mutation completes
    /// either way; pausing only stops the next one from starting.
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.online == online {
                return;
            }
            state.online = online;
        }
        info!(online, "mutation queue availability changed");
        if online {
            self.shared.wake.notify_one();
        }
    }

    /// Number of mutations waiting (excluding one in flight).
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Whether nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && state.executing.is_none()
    }

    /// The configuration the queue was opened with.
    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Drops every queued mutation and clears the backing store.
    /// Handlers of dropped mutations never fire; an in-flight mutation
    /// has its outcome suppressed.
    pub fn clear(&self) -> EngineResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.pending.clear();
            if state.executing.is_some() {
                state.cancel_executing = true;
            }
        }
        self.shared.table.clear()?;
        Ok(())
    }

    async fn watch_bus(
        shared: Arc<QueueShared>,
        mut receiver: tokio::sync::broadcast::Receiver<ClientEvent>,
        auto_resubmit: bool,
    ) {
        loop {
            match receiver.recv().await {
                Ok(ClientEvent::ReachabilityChanged { reachable }) => {
                    let changed = {
                        let mut state = shared.state.lock();
                        let target = if reachable {
                            if !auto_resubmit {
                                continue;
                            }
                            true
                        } else {
                            false
                        };
                        if state.online == target {
                            false
                        } else {
                            state.online = target;
                            true
                        }
                    };
                    if changed {
                        info!(reachable, "reachability change applied to queue");
                        if reachable {
                            shared.wake.notify_one();
                        }
                    }
                }
                Ok(ClientEvent::EnteredForeground) => {
                    // Nothing queue-specific; draining is driven by
                    // reachability.
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn run(
        shared: Arc<QueueShared>,
        transport: Arc<dyn Transport>,
        retry_strategy: RetryStrategy,
    ) {
        loop {
            // Claim the head of the queue, or park.
            let mut work = loop {
                {
                    let mut state = shared.state.lock();
                    if state.shutdown {
                        return;
                    }
                    if state.online && state.executing.is_none() {
                        if let Some(mut pending) = state.pending.pop_front() {
                            pending.record.state = RecordState::Executing;
                            state.executing = Some(pending.record.id);
                            state.cancel_executing = false;
                            break pending;
                        }
                    }
                }
                shared.wake.notified().await;
            };

            persist_record(&shared.table, &work.record);

            let mut retries = RetryHandler::new(retry_strategy);
            let outcome = loop {
                debug!(id = %work.record.id, name = %work.record.operation.name,
                       "executing mutation");
                match transport.execute_mutation(&work.record.operation).await {
                    Ok(response) => break Ok(response),
                    Err(err) => {
                        if cancelled(&shared, work.record.id) {
                            break Err(err);
                        }
                        let advice = retries.should_retry(&err);
                        if !advice.should_retry {
                            break Err(err);
                        }
                        let wait = advice.wait.unwrap_or_default();
                        debug!(id = %work.record.id, attempt = retries.attempts(),
                               wait_ms = wait.as_millis() as u64, error = %err,
                               "retrying mutation");
                        tokio::time::sleep(wait).await;
                        if !online(&shared) {
                            // Went offline mid-backoff; the record stays
                            // executing and resumes when the queue does.
                            shared.wake.notified().await;
                        }
                    }
                }
            };

            // Conflict with a hook: rewrite and put back at the head.
            // A cancelled mutation skips resolution and goes terminal.
            let resolution = match (&outcome, work.hook.clone()) {
                (Err(EngineError::Conflict(server_state)), Some(hook))
                    if !cancelled(&shared, work.record.id) =>
                {
                    hook.resolve(server_state)
                }
                _ => None,
            };
            if let Some(replacement) = resolution {
                info!(id = %work.record.id,
                      "conflict resolved; re-enqueueing replacement at head");
                work.record.operation = replacement;
                work.record.state = RecordState::Queued;
                persist_record(&shared.table, &work.record);
                let replaced_key = record_key(work.record.priority, work.record.seq);
                let suppressed = {
                    let mut state = shared.state.lock();
                    // Cancel may have landed while the hook ran.
                    let suppressed = state.cancel_executing;
                    state.executing = None;
                    state.cancel_executing = false;
                    if !suppressed {
                        state.pending.push_front(work);
                    }
                    suppressed
                };
                if suppressed {
                    if let Err(err) = shared.table.delete(&replaced_key) {
                        warn!(error = %err, "failed to delete cancelled record");
                    }
                }
                shared.wake.notify_one();
                continue;
            }

            // Terminal outcome: remove the record, then report.
            let key = record_key(work.record.priority, work.record.seq);
            if let Err(err) = shared.table.delete(&key) {
                error!(id = %work.record.id, error = %err,
                       "failed to delete completed mutation record");
            }
            let suppressed = {
                let mut state = shared.state.lock();
                let suppressed = state.cancel_executing;
                state.executing = None;
                state.cancel_executing = false;
                suppressed
            };
            match &outcome {
                Ok(_) => debug!(id = %work.record.id, "mutation completed"),
                Err(err) => warn!(id = %work.record.id, error = %err, "mutation failed"),
            }
            if let Some(handler) = work.handler.take() {
                if suppressed {
                    debug!(id = %work.record.id, "outcome suppressed by cancellation");
                } else {
                    handler(outcome);
                }
            }
            shared.wake.notify_one();
        }
    }
}

impl Drop for MutationQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
        self.run_task.abort();
        self.bus_task.abort();
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn online(shared: &QueueShared) -> bool {
    shared.state.lock().online
}

fn cancelled(shared: &QueueShared, id: Uuid) -> bool {
    let state = shared.state.lock();
    state.cancel_executing && state.executing == Some(id)
}

fn persist_record(table: &Arc<dyn KeyValueTable>, record: &MutationRecord) {
    let mut bytes = Vec::new();
    if let Err(err) = ciborium::into_writer(record, &mut bytes) {
        warn!(id = %record.id, error = %err, "failed to encode record update");
        return;
    }
    if let Err(err) = table.put(&record_key(record.priority, record.seq), &bytes) {
        warn!(id = %record.id, error = %err, "failed to persist record update");
    }
}
