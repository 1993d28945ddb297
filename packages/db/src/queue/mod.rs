//! Persistent job queues.
//!
//! A queue implementation comes in two halves: [`JobQueue`] for claiming and
//! enqueueing work, and [`JobQueueMonitoringApi`] for read-only listings.
//! [`JobQueueProvider`] hands out both, and [`QueueProviders`] maps queue
//! names to providers.

mod registry;
mod surreal;

use std::sync::Arc;

use async_trait::async_trait;
use jobstore_core::{EnqueuedAndFetchedCount, JobId};
use tokio::sync::watch;

use crate::connection::{StoreContext, StoreError};
use crate::fetched_job::FetchedJob;

pub use registry::QueueProviders;
pub(crate) use registry::same_provider;
pub use surreal::{SurrealJobQueue, SurrealJobQueueMonitoringApi, SurrealQueueProvider};

/// Queue operations used by workers and transactions.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Block until a job from one of `queues` is leased, or `cancel` fires.
    ///
    /// Earlier queues in the slice win over later ones.
    async fn dequeue(
        &self,
        queues: &[String],
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedJob, StoreError>;

    /// Put a job into `queue`, making it immediately claimable.
    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), StoreError>;
}

/// Read-only queue listings.
#[async_trait]
pub trait JobQueueMonitoringApi: Send + Sync {
    /// Names of every queue that currently holds at least one job.
    async fn queues(&self) -> Result<Vec<String>, StoreError>;

    /// Waiting (unleased) job ids, oldest first.
    async fn enqueued_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Leased job ids, oldest lease first.
    async fn fetched_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, StoreError>;

    async fn enqueued_and_fetched_count(&self, queue: &str) -> Result<EnqueuedAndFetchedCount, StoreError>;
}

/// Factory for a queue backend.
pub trait JobQueueProvider: Send + Sync {
    fn job_queue(&self, ctx: &StoreContext) -> Arc<dyn JobQueue>;

    fn monitoring_api(&self, ctx: &StoreContext) -> Arc<dyn JobQueueMonitoringApi>;
}

/// Create a cancellation signal for [`JobQueue::dequeue`].
///
/// Sending `true` cancels every receiver. Dropping the sender without
/// sending leaves receivers uncancelled forever.
pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once `cancel` carries `true`.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Reject empty queue lists and blank queue names.
pub(crate) fn validate_queues(queues: &[String]) -> Result<(), StoreError> {
    if queues.is_empty() {
        return Err(StoreError::InvalidArgument("queue list must be non-empty".into()));
    }
    if queues.iter().any(|q| q.is_empty()) {
        return Err(StoreError::InvalidArgument("queue names must be non-empty".into()));
    }
    Ok(())
}
