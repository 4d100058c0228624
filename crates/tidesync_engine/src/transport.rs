//! Transport abstraction.
//!
//! The engine is transport-agnostic: it hands opaque operations to a
//! [`Transport`] and receives decoded responses back. Conflict
//! detection is the transport's job; it must map a backend conditional
//! write rejection into [`EngineError::Conflict`] with the server's
//! state attached, never by inspecting error message text.
//!
//! [`MockTransport`] and [`MockRealtime`] are in-crate, deterministic
//! implementations used by the test suites and useful to downstream
//! integrations for the same purpose.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tidesync_protocol::{MutationResponse, Operation, QueryResponse};

use crate::error::{EngineError, EngineResult};

/// Request/response channel for queries and mutations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes a query and returns its decoded response.
    async fn execute_query(&self, operation: &Operation) -> EngineResult<QueryResponse>;

    /// Executes a mutation and returns its decoded response.
    ///
    /// Conditional write rejections must surface as
    /// [`EngineError::Conflict`].
    async fn execute_mutation(&self, operation: &Operation) -> EngineResult<MutationResponse>;
}

/// Real-time channel for subscriptions.
///
/// `subscribe` resolves only once the backend has acknowledged the
/// subscription; the multiplexer's connect-ordering barrier depends on
/// that.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens a wire subscription for `topic`, resolving on acknowledgment.
    async fn subscribe(&self, topic: &str) -> EngineResult<()>;

    /// Tears down the wire subscription for `topic`.
    async fn unsubscribe(&self, topic: &str) -> EngineResult<()>;
}

/// Scriptable in-memory [`Transport`].
///
/// Responses are popped from per-kind queues; an empty queue yields an
/// empty success so simple tests need no scripting. Requests can be
/// gated behind a semaphore to hold them in flight deterministically.
#[derive(Default)]
pub struct MockTransport {
    query_responses: Mutex<VecDeque<EngineResult<QueryResponse>>>,
    mutation_responses: Mutex<VecDeque<EngineResult<MutationResponse>>>,
    executed_queries: Mutex<Vec<Operation>>,
    executed_mutations: Mutex<Vec<Operation>>,
    query_gate: Mutex<Option<Arc<Semaphore>>>,
    mutation_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    /// Creates a transport that answers everything with empty successes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next query response.
    pub fn push_query_response(&self, response: EngineResult<QueryResponse>) {
        self.query_responses.lock().push_back(response);
    }

    /// Scripts the next mutation response.
    pub fn push_mutation_response(&self, response: EngineResult<MutationResponse>) {
        self.mutation_responses.lock().push_back(response);
    }

    /// Holds every subsequent query until [`release_query`] is called.
    ///
    /// [`release_query`]: MockTransport::release_query
    pub fn gate_queries(&self) {
        *self.query_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Releases one gated query.
    pub fn release_query(&self) {
        if let Some(gate) = self.query_gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Holds every subsequent mutation until [`release_mutation`] is called.
    ///
    /// [`release_mutation`]: MockTransport::release_mutation
    pub fn gate_mutations(&self) {
        *self.mutation_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Releases one gated mutation.
    pub fn release_mutation(&self) {
        if let Some(gate) = self.mutation_gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Every query executed so far, in order.
    pub fn executed_queries(&self) -> Vec<Operation> {
        self.executed_queries.lock().clone()
    }

    /// Every mutation executed so far, in order.
    pub fn executed_mutations(&self) -> Vec<Operation> {
        self.executed_mutations.lock().clone()
    }

    /// Number of mutations whose execution has started.
    pub fn started_mutations(&self) -> usize {
        self.executed_mutations.lock().len()
    }

    async fn wait_gate(gate: Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            // Permit is consumed; each release frees exactly one request.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute_query(&self, operation: &Operation) -> EngineResult<QueryResponse> {
        self.executed_queries.lock().push(operation.clone());
        let gate = self.query_gate.lock().clone();
        Self::wait_gate(gate).await;
        match self.query_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(QueryResponse::new(Value::Null)),
        }
    }

    async fn execute_mutation(&self, operation: &Operation) -> EngineResult<MutationResponse> {
        self.executed_mutations.lock().push(operation.clone());
        let gate = self.mutation_gate.lock().clone();
        Self::wait_gate(gate).await;
        match self.mutation_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(MutationResponse::new(Value::Null)),
        }
    }
}

/// A call observed by [`MockRealtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeCall {
    /// `subscribe` was invoked for the topic.
    Subscribe(String),
    /// `unsubscribe` was invoked for the topic.
    Unsubscribe(String),
}

/// Scriptable in-memory [`RealtimeTransport`].
///
/// Acknowledges subscriptions immediately by default; in manual mode
/// each `subscribe` blocks until the test acknowledges or rejects its
/// topic, which is how out-of-order acknowledgment is simulated.
#[derive(Default)]
pub struct MockRealtime {
    manual_ack: AtomicBool,
    pending: Mutex<Vec<(String, oneshot::Sender<EngineResult<()>>)>>,
    subscribed: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<RealtimeCall>>,
}

impl MockRealtime {
    /// Creates a transport that acknowledges every subscription at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to manual acknowledgment.
    pub fn manual_ack(&self) {
        self.manual_ack.store(true, Ordering::SeqCst);
    }

    /// Acknowledges the oldest pending subscription for `topic`.
    /// Returns whether one was waiting.
    pub fn ack(&self, topic: &str) -> bool {
        self.complete(topic, Ok(()))
    }

    /// Rejects the oldest pending subscription for `topic`.
    pub fn reject(&self, topic: &str, error: EngineError) -> bool {
        self.complete(topic, Err(error))
    }

    fn complete(&self, topic: &str, result: EngineResult<()>) -> bool {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|(t, _)| t == topic) {
            let (_, tx) = pending.remove(pos);
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    /// Whether a wire subscription for `topic` is currently open.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.lock().contains(topic)
    }

    /// All subscribe/unsubscribe calls observed, in order.
    pub fn calls(&self) -> Vec<RealtimeCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RealtimeTransport for MockRealtime {
    async fn subscribe(&self, topic: &str) -> EngineResult<()> {
        self.calls.lock().push(RealtimeCall::Subscribe(topic.to_owned()));
        if self.manual_ack.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push((topic.to_owned(), tx));
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(EngineError::Cancelled),
            }
        }
        self.subscribed.lock().insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> EngineResult<()> {
        self.calls.lock().push(RealtimeCall::Unsubscribe(topic.to_owned()));
        self.subscribed.lock().remove(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unscripted_requests_succeed_empty() {
        let transport = MockTransport::new();
        let op = Operation::query("Q", "query Q { field }");
        let response = transport.execute_query(&op).await.unwrap();
        assert!(response.records.is_empty());
        assert_eq!(transport.executed_queries().len(), 1);
    }

    #[tokio::test]
    async fn scripted_errors_pop_in_order() {
        let transport = MockTransport::new();
        transport.push_query_response(Err(EngineError::connectivity("down")));
        transport.push_query_response(Ok(QueryResponse::new(serde_json::json!({"ok": true}))));
        let op = Operation::query("Q", "query Q { field }");
        assert!(transport.execute_query(&op).await.is_err());
        assert!(transport.execute_query(&op).await.is_ok());
    }

    #[tokio::test]
    async fn manual_ack_blocks_until_released() {
        let realtime = Arc::new(MockRealtime::new());
        realtime.manual_ack();
        let handle = {
            let realtime = Arc::clone(&realtime);
            tokio::spawn(async move { realtime.subscribe("t1").await })
        };
        tokio::task::yield_now().await;
        assert!(!realtime.is_subscribed("t1"));
        while !realtime.ack("t1") {
            tokio::task::yield_now().await;
        }
        handle.await.unwrap().unwrap();
        assert!(realtime.is_subscribed("t1"));
    }
}
