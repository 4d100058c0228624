//! Subscription multiplexing.
//!
//! Many logical watchers share one wire subscription per topic. The
//! multiplexer opens the wire subscription when the first watcher for
//! a topic arrives and tears it down when the last one leaves, fans
//! messages out to every watcher on the message's topic, and enforces
//! the connect-ordering barrier: connection acknowledgments reach
//! watchers in registration order even when the wire acknowledges
//! topics out of order.
//!
//! Watchers are owned by the multiplexer and addressed by [`WatcherId`]
//! handles; they communicate outward only through the callbacks they
//! were registered with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tidesync_protocol::SubscriptionMessage;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::transport::RealtimeTransport;

/// Handle to a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(u64);

/// Callbacks a logical subscriber registers with the multiplexer.
///
/// `on_connected` fires at most once per registration, in registration
/// order across all watchers. The other callbacks carry no ordering
/// guarantee relative to other watchers.
pub trait TopicWatcher: Send + Sync {
    /// All of this watcher's topics are acknowledged and every earlier
    /// registration has been notified.
    fn on_connected(&self);

    /// A topic this watcher listens on lost its wire subscription.
    fn on_disconnected(&self);

    /// A topic this watcher listens on failed. A failure before the
    /// connect acknowledgment consumes the watcher's `on_connected`.
    fn on_error(&self, error: &EngineError);

    /// A message arrived on one of this watcher's topics.
    fn on_message(&self, message: &SubscriptionMessage);
}

struct WatcherEntry {
    watcher: Arc<dyn TopicWatcher>,
    topics: Vec<String>,
    /// All topics acknowledged (or failed); eligible for the barrier.
    ready: bool,
    /// Connect (or pre-connect error) already delivered.
    notified: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TopicPhase {
    Pending,
    Connected,
}

struct TopicState {
    phase: TopicPhase,
    watchers: BTreeSet<WatcherId>,
}

struct MuxState {
    watchers: BTreeMap<WatcherId, WatcherEntry>,
    topics: HashMap<String, TopicState>,
    next_id: u64,
    /// Barrier cursor: lowest registration sequence not yet notified.
    next_connect: u64,
    /// A drain is in progress; concurrent triggers defer to it.
    draining: bool,
}

struct MuxInner {
    realtime: Arc<dyn RealtimeTransport>,
    state: Mutex<MuxState>,
}

/// Shares wire subscriptions among logical watchers.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl SubscriptionMultiplexer {
    /// Creates a multiplexer over a real-time transport.
    pub fn new(realtime: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                realtime,
                state: Mutex::new(MuxState {
                    watchers: BTreeMap::new(),
                    topics: HashMap::new(),
                    next_id: 0,
                    next_connect: 0,
                    draining: false,
                }),
            }),
        }
    }

    /// Registers a watcher on `topics`, opening wire subscriptions for
    /// topics nobody listens on yet. Returns a handle used to remove
    /// the watcher later.
    pub fn add_watcher(
        &self,
        watcher: Arc<dyn TopicWatcher>,
        topics: Vec<String>,
    ) -> WatcherId {
        let mut new_topics = Vec::new();
        let id;
        {
            let mut state = self.inner.state.lock();
            id = WatcherId(state.next_id);
            state.next_id += 1;
            let mut ready = true;
            for topic in &topics {
                let entry = state
                    .topics
                    .entry(topic.clone())
                    .or_insert_with(|| {
                        new_topics.push(topic.clone());
                        TopicState {
                            phase: TopicPhase::Pending,
                            watchers: BTreeSet::new(),
                        }
                    });
                entry.watchers.insert(id);
                if entry.phase != TopicPhase::Connected {
                    ready = false;
                }
            }
            // A watcher with no topics still occupies a barrier slot.
            state.watchers.insert(
                id,
                WatcherEntry {
                    watcher,
                    topics: topics.clone(),
                    ready,
                    notified: false,
                },
            );
        }
        debug!(watcher = id.0, ?topics, "registered watcher");
        for topic in new_topics {
            self.spawn_subscribe(topic);
        }
        // Already-connected topics may make this watcher deliverable.
        self.drain_barrier();
        id
    }

    /// Removes a watcher, tearing down wire subscriptions its departure
    /// leaves unwatched. Removing a watcher that never received its
    /// connect unblocks later registrations. Idempotent.
    pub fn remove_watcher(&self, id: WatcherId) {
        let mut empty_topics = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.watchers.remove(&id) else {
                return;
            };
            for topic in entry.topics {
                if let Some(topic_state) = state.topics.get_mut(&topic) {
                    topic_state.watchers.remove(&id);
                    if topic_state.watchers.is_empty() {
                        state.topics.remove(&topic);
                        empty_topics.push(topic);
                    }
                }
            }
        }
        debug!(watcher = id.0, "removed watcher");
        for topic in empty_topics {
            self.spawn_unsubscribe(topic);
        }
        self.drain_barrier();
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.state.lock().watchers.len()
    }

    /// Whether a wire subscription for `topic` is wanted right now.
    pub fn topic_is_active(&self, topic: &str) -> bool {
        self.inner.state.lock().topics.contains_key(topic)
    }

    /// Delivers a message to every watcher on its topic. Called by the
    /// integration layer that owns the wire connection.
    pub fn dispatch_message(&self, message: &SubscriptionMessage) {
        let watchers = self.watchers_of(&message.topic);
        for watcher in watchers {
            watcher.on_message(message);
        }
    }

    /// Reports loss of the wire subscription for `topic`. Fans out to
    /// the topic's watchers without any ordering guarantee.
    pub fn notify_disconnected(&self, topic: &str) {
        let watchers = self.watchers_of(topic);
        for watcher in watchers {
            watcher.on_disconnected();
        }
    }

    /// Reports a mid-stream failure of `topic`'s wire subscription.
    pub fn notify_error(&self, topic: &str, error: &EngineError) {
        let watchers = self.watchers_of(topic);
        for watcher in watchers {
            watcher.on_error(error);
        }
    }

    fn watchers_of(&self, topic: &str) -> Vec<Arc<dyn TopicWatcher>> {
        let state = self.inner.state.lock();
        let Some(topic_state) = state.topics.get(topic) else {
            return Vec::new();
        };
        topic_state
            .watchers
            .iter()
            .filter_map(|id| state.watchers.get(id))
            .map(|entry| Arc::clone(&entry.watcher))
            .collect()
    }

    fn spawn_subscribe(&self, topic: String) {
        let inner = Arc::clone(&self.inner);
        let mux = Self { inner: Arc::clone(&self.inner) };
        tokio::spawn(async move {
            match inner.realtime.subscribe(&topic).await {
                Ok(()) => mux.handle_topic_connected(&topic),
                Err(err) => mux.handle_topic_failed(&topic, err),
            }
        });
    }

    fn spawn_unsubscribe(&self, topic: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = inner.realtime.unsubscribe(&topic).await {
                warn!(topic, error = %err, "unsubscribe failed");
            }
        });
    }

    fn handle_topic_connected(&self, topic: &str) {
        let orphaned = {
            let mut state = self.inner.state.lock();
            match state.topics.get_mut(topic) {
                Some(topic_state) => {
                    topic_state.phase = TopicPhase::Connected;
                    let ids: Vec<WatcherId> =
                        topic_state.watchers.iter().copied().collect();
                    for id in ids {
                        Self::recompute_ready(&mut state, id);
                    }
                    false
                }
                // Every watcher left while the ack was in flight.
                None => true,
            }
        };
        if orphaned {
            self.spawn_unsubscribe(topic.to_owned());
            return;
        }
        debug!(topic, "topic connected");
        self.drain_barrier();
    }

    fn handle_topic_failed(&self, topic: &str, error: EngineError) {
        let affected = {
            let mut state = self.inner.state.lock();
            // Drop the topic so a later registration subscribes afresh.
            let Some(topic_state) = state.topics.remove(topic) else {
                return;
            };
            let ids: Vec<WatcherId> = topic_state.watchers.iter().copied().collect();
            // The failed topic no longer gates the barrier; the error
            // consumes these watchers' connect slots.
            for &id in &ids {
                if let Some(entry) = state.watchers.get_mut(&id) {
                    entry.ready = true;
                    entry.notified = true;
                }
            }
            ids.iter()
                .filter_map(|id| state.watchers.get(id))
                .map(|entry| Arc::clone(&entry.watcher))
                .collect::<Vec<_>>()
        };
        warn!(topic, error = %error, "subscription failed to connect");
        for watcher in affected {
            watcher.on_error(&error);
        }
        self.drain_barrier();
    }

    fn recompute_ready(state: &mut MuxState, id: WatcherId) {
        let ready = match state.watchers.get(&id) {
            Some(entry) => entry.topics.iter().all(|topic| {
                state
                    .topics
                    .get(topic)
                    .map(|t| t.phase == TopicPhase::Connected)
                    .unwrap_or(true)
            }),
            None => return,
        };
        if let Some(entry) = state.watchers.get_mut(&id) {
            entry.ready = ready;
        }
    }

    /// Delivers pending connects in registration order, stopping at the
    /// first watcher that is not ready yet. Removed registrations just
    /// advance the cursor.
    ///
    /// Only one caller drains at a time. A trigger arriving while a
    /// drain is delivering returns immediately; the active drainer
    /// re-collects after each batch and picks the new work up, keeping
    /// concurrent acknowledgments from interleaving their connects out
    /// of order.
    fn drain_barrier(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let batch = {
                let mut state = self.inner.state.lock();
                let mut batch = Vec::new();
                while state.next_connect < state.next_id {
                    let cursor = WatcherId(state.next_connect);
                    match state.watchers.get_mut(&cursor) {
                        None => state.next_connect += 1,
                        Some(entry) if entry.notified => state.next_connect += 1,
                        Some(entry) if entry.ready => {
                            entry.notified = true;
                            batch.push(Arc::clone(&entry.watcher));
                            state.next_connect += 1;
                        }
                        Some(_) => break,
                    }
                }
                if batch.is_empty() {
                    state.draining = false;
                    return;
                }
                batch
            };
            for watcher in batch {
                watcher.on_connected();
            }
        }
    }
}
