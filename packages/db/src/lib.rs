//! SurrealDB-backed job storage.
//!
//! This crate persists jobs, their state history and the auxiliary counters,
//! sets, lists and hashes a job runtime keeps, and runs the distributed work
//! queue on top of them.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod clock;
mod connection;
mod rows;
mod schema;
pub mod expiration;
pub mod fetched_job;
pub mod lock;
pub mod monitoring;
pub mod queue;
pub mod repositories;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use jobstore_core::JobId;
use tokio::sync::watch;

pub use clock::{SYNC_INTERVAL, ServerClock};
pub use connection::{Database, StorageOptions, StoreContext, StoreError, connect};
pub use expiration::{CountersAggregator, ExpirationManager, SweepReport};
pub use fetched_job::FetchedJob;
pub use lock::DistributedLock;
pub use monitoring::MonitoringApi;
pub use queue::{
    JobQueue, JobQueueMonitoringApi, JobQueueProvider, QueueProviders, SurrealQueueProvider, cancellation,
};
pub use schema::{Collections, REQUIRED_SCHEMA_VERSION, init_schema, stored_schema_version, write_schema_version};
pub use transaction::{AggregateKind, Command, WriteOnlyTransaction};

/// Entry point: one connected, schema-checked store plus its queue providers.
#[derive(Clone)]
pub struct JobStorage {
    ctx: StoreContext,
    providers: QueueProviders,
}

impl JobStorage {
    /// Connect, initialize the schema and register the SurrealDB queue as default.
    ///
    /// Fails with [`StoreError::SchemaIncompatible`] if the store was written
    /// by a newer schema version.
    pub async fn connect(options: StorageOptions) -> Result<Self, StoreError> {
        let db = connect(&options).await?;
        let ctx = StoreContext::new(db, options)?;
        init_schema(&ctx).await?;

        Ok(Self {
            ctx,
            providers: QueueProviders::new(Arc::new(SurrealQueueProvider)),
        })
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn providers(&self) -> &QueueProviders {
        &self.providers
    }

    /// Route `queues` to `provider`.
    pub fn add_provider<I, S>(&mut self, provider: Arc<dyn JobQueueProvider>, queues: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers.add(provider, queues);
    }

    /// Lease the next job from `queues`, earlier queues first.
    ///
    /// Every queue must be served by the same provider.
    pub async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedJob, StoreError> {
        queue::validate_queues(queues)?;

        let provider = self.providers.provider_for(&queues[0]);
        if queues[1..]
            .iter()
            .any(|q| !queue::same_provider(&self.providers.provider_for(q), &provider))
        {
            return Err(StoreError::InvalidArgument(format!(
                "queues {:?} are served by different providers",
                queues
            )));
        }

        provider.job_queue(&self.ctx).dequeue(queues, cancel).await
    }

    /// Put a job into `queue` through its provider.
    pub async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), StoreError> {
        self.providers
            .provider_for(queue)
            .job_queue(&self.ctx)
            .enqueue(queue, job_id)
            .await
    }

    pub fn write_transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(self.ctx.clone(), self.providers.clone())
    }

    pub fn monitoring(&self) -> MonitoringApi {
        MonitoringApi::new(self.ctx.clone(), self.providers.clone())
    }

    pub fn jobs(&self) -> repositories::JobRepository {
        repositories::JobRepository::new(self.ctx.clone())
    }

    pub fn aggregates(&self) -> repositories::AggregateRepository {
        repositories::AggregateRepository::new(self.ctx.clone())
    }

    pub fn servers(&self) -> repositories::ServerRepository {
        repositories::ServerRepository::new(self.ctx.clone())
    }

    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(self.ctx.clone())
    }

    pub fn counters_aggregator(&self) -> CountersAggregator {
        CountersAggregator::new(self.ctx.clone())
    }

    /// Take the store-wide lock on `resource`, waiting up to `timeout`.
    pub async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<DistributedLock, StoreError> {
        DistributedLock::acquire(self.ctx.clone(), resource, timeout).await
    }
}

impl std::fmt::Debug for JobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStorage")
            .field("ctx", &self.ctx)
            .field("queues", &self.providers.registered_queues())
            .finish()
    }
}
