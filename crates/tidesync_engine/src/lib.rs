//! # tidesync Engine
//!
//! Offline-first synchronization engine for tidesync.
//!
//! Keeps a local normalized cache convergent with a remote backend
//! across connectivity loss and process restarts:
//!
//! - [`MutationQueue`] accepts writes locally, persists them before
//!   acknowledging, and delivers them one at a time in order, with
//!   structured conflict resolution hooks.
//! - [`DeltaSyncCoordinator`] runs sync sessions: base query, delta
//!   query and live subscription stitched together so no server-side
//!   change is missed or applied out of order.
//! - [`SubscriptionMultiplexer`] shares wire subscriptions among
//!   logical watchers and keeps connection acknowledgments in
//!   registration order.
//! - [`SyncClient`] wires all of it together over one pair of
//!   transports.
//!
//! The engine is transport-agnostic; integrations implement
//! [`Transport`] and [`RealtimeTransport`] and publish reachability
//! and lifecycle changes into the client's [`EventBus`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tidesync_engine::{
//!     MockRealtime, MockTransport, MutationRequest, QueueConfig, StorageConfig,
//!     SyncClient, SyncSessionConfig,
//! };
//! use tidesync_protocol::Operation;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SyncClient::open(
//!     Arc::new(MockTransport::new()),
//!     Arc::new(MockRealtime::new()),
//!     StorageConfig::in_memory(),
//!     QueueConfig::default(),
//!     SyncSessionConfig::default(),
//! )?;
//!
//! let op = Operation::mutation("CreatePost", "mutation CreatePost { createPost { id } }");
//! client.mutate(MutationRequest::new(op))?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod metadata;
pub mod mux;
pub mod queue;
pub mod transport;

pub use backoff::{retry_delay, RetryAdvice, RetryHandler, RetryStrategy, MAX_RETRY_WAIT};
pub use client::{
    ClearCacheFailure, ClearCacheOptions, ClearCacheTarget, StorageConfig, SyncClient,
};
pub use coordinator::{
    DeltaSyncCoordinator, ResultSource, SubscriptionEvent, SyncHandler, SyncSession,
    SyncSessionConfig, SyncState, DEFAULT_SYNC_INTERVAL,
};
pub use error::{EngineError, EngineResult};
pub use events::{ClientEvent, EventBus};
pub use metadata::SyncMetadataStore;
pub use mux::{SubscriptionMultiplexer, TopicWatcher, WatcherId};
pub use queue::{
    ConflictHook, MutationHandle, MutationPriority, MutationQueue, MutationRecord,
    MutationRequest, QueueConfig, RecordState,
};
pub use transport::{MockRealtime, MockTransport, RealtimeCall, RealtimeTransport, Transport};
