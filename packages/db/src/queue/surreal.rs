//! The SurrealDB job queue: queue state lives on the job record itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobstore_core::{EnqueuedAndFetchedCount, JobId};
use serde::Deserialize;
use surrealdb::sql::Thing;
use tokio::sync::watch;

use super::{JobQueue, JobQueueMonitoringApi, JobQueueProvider, cancelled, validate_queues};
use crate::connection::{StoreContext, StoreError, chrono_duration};
use crate::fetched_job::FetchedJob;
use crate::rows::{CountRow, IdRow, first_count, into_records, record_key};

/// Upper bound on lost claim races per queue before falling back to the poll wait.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Predicate shared by the candidate search and the claim itself.
const CLAIMABLE: &str = "queue = $queue AND (fetched_at = NONE OR fetched_at < <datetime> $cutoff)";

/// Outcome of one claim pass over a single queue.
enum Claim {
    Leased(FetchedJob),
    Empty,
    /// Every attempt lost its race to another worker.
    Contended,
}

#[derive(Debug, Deserialize)]
struct CandidateRow {
    id: Thing,
}

#[derive(Debug, Deserialize)]
struct ClaimedRow {
    id: Thing,
    #[serde(default)]
    queue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueNameRow {
    queue: String,
}

/// Job queue over the job table.
///
/// Claiming is a compare-and-swap on `fetched_at`: the candidate is re-checked
/// against the claimable predicate inside the same `UPDATE` that sets the
/// lease, so of two racing workers at most one gets the row back.
pub struct SurrealJobQueue {
    ctx: StoreContext,
    max_claim_attempts: usize,
}

impl SurrealJobQueue {
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            ctx,
            max_claim_attempts: MAX_CLAIM_ATTEMPTS,
        }
    }

    #[cfg(test)]
    fn with_max_claim_attempts(mut self, attempts: usize) -> Self {
        self.max_claim_attempts = attempts;
        self
    }

    /// Claim the oldest claimable job of one queue.
    async fn try_claim(&self, queue: &str) -> Result<Claim, StoreError> {
        let invisibility = chrono_duration(self.ctx.options().invisibility_timeout);

        for _ in 0..self.max_claim_attempts {
            let cutoff = self.ctx.clock().now().await? - invisibility;

            let Some(candidate) = self.find_candidate(queue, cutoff).await? else {
                return Ok(Claim::Empty);
            };

            match self.claim(&candidate, queue, cutoff).await {
                Ok(Some(claimed)) => {
                    let job_id = crate::rows::parse_job_id(&record_key(&claimed.id))?;
                    let queue = claimed.queue.unwrap_or_else(|| queue.to_string());
                    tracing::debug!("Leased job {} from queue {}", job_id, queue);
                    return FetchedJob::new(self.ctx.clone(), job_id, queue).map(Claim::Leased);
                }
                Ok(None) => {
                    tracing::debug!("Lost lease race for {} in queue {}", record_key(&candidate), queue);
                }
                Err(e) if e.is_write_conflict() => {
                    tracing::debug!("Write conflict leasing {} in queue {}", record_key(&candidate), queue);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            "Gave up leasing from queue {} after {} contended attempts",
            queue,
            self.max_claim_attempts
        );
        Ok(Claim::Contended)
    }

    async fn find_candidate(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<Option<Thing>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT id, created_at FROM {} WHERE {} ORDER BY created_at ASC, id ASC LIMIT 1;",
                self.ctx.collections().job,
                CLAIMABLE
            ))
            .bind(("queue", queue.to_string()))
            .bind(("cutoff", cutoff))
            .await?;

        let rows: Vec<CandidateRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.id))
    }

    async fn claim(
        &self,
        candidate: &Thing,
        queue: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ClaimedRow>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "UPDATE type::thing('{}', $id) SET fetched_at = time::now() WHERE {} RETURN AFTER;",
                self.ctx.collections().job,
                CLAIMABLE
            ))
            .bind(("id", record_key(candidate)))
            .bind(("queue", queue.to_string()))
            .bind(("cutoff", cutoff))
            .await?;

        let rows: Vec<ClaimedRow> = response.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl JobQueue for SurrealJobQueue {
    async fn dequeue(
        &self,
        queues: &[String],
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedJob, StoreError> {
        validate_queues(queues)?;

        let mut cancel = cancel.clone();
        let poll_interval = self.ctx.options().queue_poll_interval;

        loop {
            if *cancel.borrow() {
                return Err(StoreError::Cancelled);
            }

            // A contended queue is retried after the wait rather than
            // letting lower-priority queues jump ahead of it.
            for queue in queues {
                match self.try_claim(queue).await? {
                    Claim::Leased(job) => return Ok(job),
                    Claim::Empty => {}
                    Claim::Contended => break,
                }
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), StoreError> {
        if queue.is_empty() {
            return Err(StoreError::InvalidArgument("queue name must be non-empty".into()));
        }

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "UPDATE type::thing('{}', $id) SET queue = $queue, fetched_at = NONE RETURN id;",
                self.ctx.collections().job
            ))
            .bind(("id", job_id.to_string()))
            .bind(("queue", queue.to_string()))
            .await?;

        let rows: Vec<IdRow> = response.take(0)?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("Job not found: {}", job_id)));
        }

        tracing::debug!("Enqueued job {} to queue {}", job_id, queue);
        Ok(())
    }
}

/// Queue listings over the job table.
pub struct SurrealJobQueueMonitoringApi {
    ctx: StoreContext,
}

impl SurrealJobQueueMonitoringApi {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    async fn job_ids(
        &self,
        queue: &str,
        leased: bool,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        let filter = if leased {
            "fetched_at != NONE ORDER BY fetched_at ASC, id ASC"
        } else {
            "fetched_at = NONE AND state_id != NONE ORDER BY created_at ASC, id ASC"
        };

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT id, created_at, fetched_at FROM {} WHERE queue = $queue AND {} LIMIT $limit START $start;",
                self.ctx.collections().job,
                filter
            ))
            .bind(("queue", queue.to_string()))
            .bind(("limit", per_page as i64))
            .bind(("start", from as i64))
            .await?;

        let rows: Vec<IdRow> = response.take(0)?;
        into_records(rows, |row| row.job_id())
    }

    async fn count(&self, queue: &str, leased: bool) -> Result<u64, StoreError> {
        let filter = if leased { "fetched_at != NONE" } else { "fetched_at = NONE" };

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT count() AS count FROM {} WHERE queue = $queue AND {} GROUP ALL;",
                self.ctx.collections().job,
                filter
            ))
            .bind(("queue", queue.to_string()))
            .await?;

        let rows: Vec<CountRow> = response.take(0)?;
        Ok(first_count(rows))
    }
}

#[async_trait]
impl JobQueueMonitoringApi for SurrealJobQueueMonitoringApi {
    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT queue FROM {} WHERE queue != NONE GROUP BY queue;",
                self.ctx.collections().job
            ))
            .await?;

        let rows: Vec<QueueNameRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.queue).collect())
    }

    async fn enqueued_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        self.job_ids(queue, false, from, per_page).await
    }

    async fn fetched_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        self.job_ids(queue, true, from, per_page).await
    }

    async fn enqueued_and_fetched_count(&self, queue: &str) -> Result<EnqueuedAndFetchedCount, StoreError> {
        Ok(EnqueuedAndFetchedCount {
            enqueued: self.count(queue, false).await?,
            fetched: self.count(queue, true).await?,
        })
    }
}

/// The provider registered as default by [`crate::JobStorage`].
#[derive(Debug, Default)]
pub struct SurrealQueueProvider;

impl JobQueueProvider for SurrealQueueProvider {
    fn job_queue(&self, ctx: &StoreContext) -> Arc<dyn JobQueue> {
        Arc::new(SurrealJobQueue::new(ctx.clone()))
    }

    fn monitoring_api(&self, ctx: &StoreContext) -> Arc<dyn JobQueueMonitoringApi> {
        Arc::new(SurrealJobQueueMonitoringApi::new(ctx.clone()))
    }
}
