//! Client facade.
//!
//! [`SyncClient`] wires the normalized cache, the mutation queue, the
//! subscription multiplexer and sync metadata together over one pair
//! of transports, and owns the event bus the platform integration
//! publishes into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tidesync_cache::{NormalizedCache, TableCache};
use tidesync_protocol::Fingerprint;
use tidesync_store::{FileTable, KeyValueTable, MemoryTable};
use tracing::info;

use crate::coordinator::{
    DeltaSyncCoordinator, SyncHandler, SyncSession, SyncSessionConfig,
};
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::metadata::SyncMetadataStore;
use crate::mux::SubscriptionMultiplexer;
use crate::queue::{MutationHandle, MutationQueue, MutationRequest, QueueConfig};
use crate::transport::{RealtimeTransport, Transport};

/// Where each store keeps its data. A `None` path means in-memory.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Backing file for the mutation queue.
    pub mutations_path: Option<PathBuf>,
    /// Backing file for the normalized cache.
    pub cache_path: Option<PathBuf>,
    /// Backing file for sync metadata.
    pub metadata_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Everything in memory; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// All three stores as files under `dir`.
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            mutations_path: Some(dir.join("mutations.log")),
            cache_path: Some(dir.join("cache.log")),
            metadata_path: Some(dir.join("metadata.log")),
        }
    }
}

/// Which stores [`SyncClient::clear_caches`] touches. Defaults to all.
#[derive(Debug, Clone, Copy)]
pub struct ClearCacheOptions {
    /// Clear the normalized query cache.
    pub queries: bool,
    /// Drop all queued mutations.
    pub mutations: bool,
    /// Forget all last-sync times.
    pub sync_metadata: bool,
}

impl Default for ClearCacheOptions {
    fn default() -> Self {
        Self {
            queries: true,
            mutations: true,
            sync_metadata: true,
        }
    }
}

/// A store that failed to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearCacheTarget {
    /// The normalized query cache.
    Queries,
    /// The mutation queue.
    Mutations,
    /// Sync metadata.
    SyncMetadata,
}

/// Aggregated failure from [`SyncClient::clear_caches`]: every selected
/// store is attempted and every failure is reported, so one broken
/// store cannot shadow the others.
#[derive(Debug, Error)]
#[error("failed to clear {} store(s)", failures.len())]
pub struct ClearCacheFailure {
    /// Which stores failed, with their errors.
    pub failures: Vec<(ClearCacheTarget, EngineError)>,
}

/// Umbrella over one synchronized backend.
pub struct SyncClient {
    cache: Arc<dyn NormalizedCache>,
    queue: MutationQueue,
    metadata: SyncMetadataStore,
    mux: SubscriptionMultiplexer,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    config: SyncSessionConfig,
}

impl SyncClient {
    /// Opens a client over the given transports and storage layout.
    ///
    /// Persisted mutations found in the mutation store are scheduled
    /// immediately. Must be called within a Tokio runtime.
    pub fn open(
        transport: Arc<dyn Transport>,
        realtime: Arc<dyn RealtimeTransport>,
        storage: StorageConfig,
        queue_config: QueueConfig,
        session_config: SyncSessionConfig,
    ) -> EngineResult<Self> {
        let bus = EventBus::new();
        let cache_table = open_table(storage.cache_path.as_deref())?;
        let cache: Arc<dyn NormalizedCache> = Arc::new(TableCache::open(cache_table)?);
        let metadata = SyncMetadataStore::new(open_table(storage.metadata_path.as_deref())?);
        let queue = MutationQueue::open(
            open_table(storage.mutations_path.as_deref())?,
            Arc::clone(&transport),
            &bus,
            queue_config,
        )?;
        let mux = SubscriptionMultiplexer::new(realtime);
        info!("sync client opened");
        Ok(Self {
            cache,
            queue,
            metadata,
            mux,
            transport,
            bus,
            config: session_config,
        })
    }

    /// The event bus platform integrations publish into.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The shared normalized cache.
    pub fn cache(&self) -> &Arc<dyn NormalizedCache> {
        &self.cache
    }

    /// The mutation queue.
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// The subscription multiplexer.
    pub fn mux(&self) -> &SubscriptionMultiplexer {
        &self.mux
    }

    /// Enqueues a mutation for durable, in-order delivery.
    pub fn mutate(&self, request: MutationRequest) -> EngineResult<MutationHandle> {
        self.queue.enqueue(request)
    }

    /// Starts a sync session for a query trio.
    pub fn sync(
        &self,
        session: SyncSession,
        handler: Arc<dyn SyncHandler>,
    ) -> EngineResult<DeltaSyncCoordinator> {
        DeltaSyncCoordinator::start(
            session,
            handler,
            Arc::clone(&self.cache),
            self.metadata.clone(),
            Arc::clone(&self.transport),
            self.mux.clone(),
            &self.bus,
            self.config,
        )
    }

    /// The recorded last-sync time for a session fingerprint.
    pub fn last_sync(&self, fingerprint: &Fingerprint) -> EngineResult<Option<std::time::SystemTime>> {
        self.metadata.last_sync(fingerprint)
    }

    /// Clears the selected stores.
    ///
    /// Intended for sign-out flows, with no sync sessions or mutations
    /// in flight. Every selected store is attempted even when an
    /// earlier one fails.
    pub fn clear_caches(&self, options: ClearCacheOptions) -> Result<(), ClearCacheFailure> {
        let mut failures = Vec::new();
        if options.queries {
            if let Err(err) = self.cache.clear() {
                failures.push((ClearCacheTarget::Queries, EngineError::from(err)));
            }
        }
        if options.mutations {
            if let Err(err) = self.queue.clear() {
                failures.push((ClearCacheTarget::Mutations, err));
            }
        }
        if options.sync_metadata {
            if let Err(err) = self.metadata.clear() {
                failures.push((ClearCacheTarget::SyncMetadata, err));
            }
        }
        if failures.is_empty() {
            info!("caches cleared");
            Ok(())
        } else {
            Err(ClearCacheFailure { failures })
        }
    }
}

fn open_table(path: Option<&Path>) -> EngineResult<Arc<dyn KeyValueTable>> {
    match path {
        Some(path) => Ok(Arc::new(FileTable::open_with_create_dirs(path)?)),
        None => Ok(Arc::new(MemoryTable::new())),
    }
}
