//! Read-only projections for dashboards and operators.
//!
//! Queue listings are delegated to the monitoring half of whichever provider
//! serves the queue; everything else reads the store directly.

use std::collections::{BTreeSet, HashMap};

use jobstore_core::{
    EnqueuedJob, FetchedJobSummary, JobDetails, JobId, JobRecord, JobSummary, QueueOverview, ServerRecord,
    StateRecord, Statistics, state_names,
};
use serde::Deserialize;

use crate::connection::{StoreContext, StoreError};
use crate::queue::QueueProviders;
use crate::repositories::{AggregateRepository, JobRepository, ServerRepository};
use crate::rows::{CountRow, JobRow, StateRow, first_count, into_records};

/// Jobs shown per queue in [`MonitoringApi::queues`].
pub const QUEUE_PREVIEW_SIZE: usize = 5;

/// Counter holding the all-time number of succeeded jobs.
pub const SUCCEEDED_COUNTER: &str = "stats:succeeded";
/// Counter holding the all-time number of deleted jobs.
pub const DELETED_COUNTER: &str = "stats:deleted";
/// Set listing recurring job ids.
pub const RECURRING_JOBS_SET: &str = "recurring-jobs";

#[derive(Debug, Deserialize)]
struct StateCountRow {
    state_name: String,
    count: i64,
}

/// Monitoring queries over one store.
pub struct MonitoringApi {
    ctx: StoreContext,
    providers: QueueProviders,
}

impl MonitoringApi {
    pub fn new(ctx: StoreContext, providers: QueueProviders) -> Self {
        Self { ctx, providers }
    }

    /// Store-wide counts.
    pub async fn statistics(&self) -> Result<Statistics, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT state_name, count() AS count FROM {} WHERE state_name != NONE GROUP BY state_name;",
                self.ctx.collections().job
            ))
            .await?;
        let rows: Vec<StateCountRow> = response.take(0)?;

        let by_state: HashMap<String, u64> = rows
            .into_iter()
            .map(|row| (row.state_name, row.count.max(0) as u64))
            .collect();
        let count = |name: &str| by_state.get(name).copied().unwrap_or(0);

        let aggregates = AggregateRepository::new(self.ctx.clone());

        Ok(Statistics {
            enqueued: count(state_names::ENQUEUED),
            failed: count(state_names::FAILED),
            processing: count(state_names::PROCESSING),
            scheduled: count(state_names::SCHEDULED),
            succeeded: aggregates.counter_value(SUCCEEDED_COUNTER).await?,
            deleted: aggregates.counter_value(DELETED_COUNTER).await?,
            servers: self.server_count().await?,
            queues: self.queue_names().await?.len() as u64,
            recurring: aggregates.set_count(RECURRING_JOBS_SET).await?,
            by_state,
        })
    }

    /// Everything known about one job, or `None` if it doesn't exist.
    pub async fn job_details(&self, job_id: JobId) -> Result<Option<JobDetails>, StoreError> {
        let jobs = JobRepository::new(self.ctx.clone());
        let Some(job) = jobs.get(job_id).await? else {
            return Ok(None);
        };
        let history = jobs.state_history(job_id).await?;

        Ok(Some(JobDetails {
            job_id: job.id,
            invocation_data: job.invocation_data,
            created_at: job.created_at,
            expire_at: job.expire_at,
            parameters: job.parameters,
            state_name: job.state_name,
            history,
        }))
    }

    /// A page of waiting jobs. Jobs leased between listing and loading are skipped.
    pub async fn enqueued_jobs(&self, queue: &str, from: usize, per_page: usize) -> Result<Vec<EnqueuedJob>, StoreError> {
        let ids = self
            .providers
            .provider_for(queue)
            .monitoring_api(&self.ctx)
            .enqueued_job_ids(queue, from, per_page)
            .await?;

        let jobs = self.load_jobs(&ids).await?;
        let states = self.load_current_states(&jobs).await?;

        Ok(jobs
            .into_iter()
            .filter(|job| job.fetched_at.is_none())
            .map(|job| {
                let enqueued_at = job
                    .state_id
                    .as_ref()
                    .and_then(|id| states.get(id))
                    .filter(|state| state.name == state_names::ENQUEUED)
                    .map(|state| state.created_at);
                EnqueuedJob {
                    job_id: job.id,
                    invocation_data: job.invocation_data,
                    state_name: job.state_name,
                    created_at: job.created_at,
                    enqueued_at,
                }
            })
            .collect())
    }

    /// A page of leased jobs.
    pub async fn fetched_jobs(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<FetchedJobSummary>, StoreError> {
        let ids = self
            .providers
            .provider_for(queue)
            .monitoring_api(&self.ctx)
            .fetched_job_ids(queue, from, per_page)
            .await?;

        Ok(self
            .load_jobs(&ids)
            .await?
            .into_iter()
            .filter(|job| job.fetched_at.is_some())
            .map(|job| FetchedJobSummary {
                job_id: job.id,
                invocation_data: job.invocation_data,
                state_name: job.state_name,
                fetched_at: job.fetched_at,
            })
            .collect())
    }

    pub async fn enqueued_count(&self, queue: &str) -> Result<u64, StoreError> {
        let counts = self
            .providers
            .provider_for(queue)
            .monitoring_api(&self.ctx)
            .enqueued_and_fetched_count(queue)
            .await?;
        Ok(counts.enqueued)
    }

    pub async fn fetched_count(&self, queue: &str) -> Result<u64, StoreError> {
        let counts = self
            .providers
            .provider_for(queue)
            .monitoring_api(&self.ctx)
            .enqueued_and_fetched_count(queue)
            .await?;
        Ok(counts.fetched)
    }

    /// Every queue with its counts and first few waiting jobs, sorted by name.
    pub async fn queues(&self) -> Result<Vec<QueueOverview>, StoreError> {
        let mut overviews = Vec::new();

        for name in self.queue_names().await? {
            let counts = self
                .providers
                .provider_for(&name)
                .monitoring_api(&self.ctx)
                .enqueued_and_fetched_count(&name)
                .await?;
            let first_jobs = self.enqueued_jobs(&name, 0, QUEUE_PREVIEW_SIZE).await?;

            overviews.push(QueueOverview {
                name,
                length: counts.enqueued,
                fetched: counts.fetched,
                first_jobs,
            });
        }

        Ok(overviews)
    }

    /// A page of jobs currently in state `state_name`, newest first.
    pub async fn jobs_by_state(
        &self,
        state_name: &str,
        from: usize,
        count: usize,
    ) -> Result<Vec<JobSummary>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT * FROM {} WHERE state_name = $state_name ORDER BY created_at DESC, id DESC \
                 LIMIT $limit START $start;",
                self.ctx.collections().job
            ))
            .bind(("state_name", state_name.to_string()))
            .bind(("limit", count as i64))
            .bind(("start", from as i64))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        let jobs = into_records(rows, JobRow::into_record)?;
        let mut states = self.load_current_states(&jobs).await?;

        Ok(jobs
            .into_iter()
            .map(|job| {
                let state = job.state_id.as_ref().and_then(|id| states.remove(id));
                JobSummary {
                    job_id: job.id,
                    invocation_data: job.invocation_data,
                    created_at: job.created_at,
                    state_name: job.state_name.unwrap_or_else(|| state_name.to_string()),
                    state_reason: state.as_ref().and_then(|s| s.reason.clone()),
                    state_data: state.map(|s| s.data).unwrap_or_default(),
                }
            })
            .collect())
    }

    pub async fn servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        ServerRepository::new(self.ctx.clone()).list().await
    }

    /// Distinct queue names across every registered provider.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = BTreeSet::new();
        for provider in self.providers.providers() {
            names.extend(provider.monitoring_api(&self.ctx).queues().await?);
        }
        Ok(names.into_iter().collect())
    }

    async fn server_count(&self) -> Result<u64, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT count() AS count FROM {} GROUP ALL;",
                self.ctx.collections().server
            ))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(first_count(rows))
    }

    /// Load jobs by id, keeping the order of `ids` and dropping missing ones.
    async fn load_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT * FROM {} WHERE record::id(id) INSIDE $ids;",
                self.ctx.collections().job
            ))
            .bind(("ids", raw))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        let mut by_id: HashMap<JobId, JobRecord> = into_records(rows, JobRow::into_record)?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Current state entry of each job, keyed by state id.
    async fn load_current_states(&self, jobs: &[JobRecord]) -> Result<HashMap<String, StateRecord>, StoreError> {
        let state_ids: Vec<String> = jobs.iter().filter_map(|job| job.state_id.clone()).collect();
        if state_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT * FROM {} WHERE record::id(id) INSIDE $ids;",
                self.ctx.collections().state
            ))
            .bind(("ids", state_ids))
            .await?;

        let rows: Vec<StateRow> = response.take(0)?;
        Ok(into_records(rows, StateRow::into_record)?
            .into_iter()
            .map(|state| (state.id.clone(), state))
            .collect())
    }
}
