//! Job repository: creation, lookup, parameters and state history.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobstore_core::{JobId, JobRecord, StateRecord};

use crate::connection::{StoreContext, StoreError, chrono_duration};
use crate::rows::{JobRow, StateRow, into_records};

/// Repository for job persistence operations.
#[derive(Debug, Clone)]
pub struct JobRepository {
    ctx: StoreContext,
}

impl JobRepository {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Create a job that expires `expire_in` after `created_at` unless persisted.
    ///
    /// The job starts with no state and no queue.
    pub async fn create_expired_job(
        &self,
        invocation_data: serde_json::Value,
        parameters: HashMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId, StoreError> {
        let id = JobId::new();
        let expire_at = created_at + chrono_duration(expire_in);

        self.ctx
            .db()
            .query(format!(
                "CREATE type::thing('{}', $id) SET invocation_data = $invocation_data, parameters = $parameters, \
                 created_at = <datetime> $created_at, expire_at = <datetime> $expire_at;",
                self.ctx.collections().job
            ))
            .bind(("id", id.to_string()))
            .bind(("invocation_data", invocation_data))
            .bind(("parameters", parameters))
            .bind(("created_at", created_at))
            .bind(("expire_at", expire_at))
            .await?
            .check()?;

        tracing::debug!("Created job {} expiring at {}", id, expire_at);
        Ok(id)
    }

    /// Get a job by ID, or `None` if it doesn't exist.
    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!("SELECT * FROM type::thing('{}', $id);", self.ctx.collections().job))
            .bind(("id", id.to_string()))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        rows.into_iter().next().map(JobRow::into_record).transpose()
    }

    /// The job's current state entry.
    pub async fn get_state(&self, job_id: JobId) -> Result<Option<StateRecord>, StoreError> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(None);
        };
        let Some(state_id) = job.state_id else {
            return Ok(None);
        };

        let mut response = self
            .ctx
            .db()
            .query(format!("SELECT * FROM type::thing('{}', $id);", self.ctx.collections().state))
            .bind(("id", state_id))
            .await?;

        let rows: Vec<StateRow> = response.take(0)?;
        rows.into_iter().next().map(StateRow::into_record).transpose()
    }

    /// Full state history, newest entry first.
    pub async fn state_history(&self, job_id: JobId) -> Result<Vec<StateRecord>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT * FROM {} WHERE job_id = $job_id ORDER BY id DESC;",
                self.ctx.collections().state
            ))
            .bind(("job_id", job_id.to_string()))
            .await?;

        let rows: Vec<StateRow> = response.take(0)?;
        into_records(rows, StateRow::into_record)
    }

    /// Set one entry of the job's parameter map.
    pub async fn set_parameter(&self, job_id: JobId, name: &str, value: &str) -> Result<(), StoreError> {
        let Some(job) = self.get(job_id).await? else {
            return Err(StoreError::NotFound(format!("Job not found: {}", job_id)));
        };

        let mut parameters = job.parameters;
        parameters.insert(name.to_string(), value.to_string());

        self.ctx
            .db()
            .query(format!(
                "UPDATE type::thing('{}', $id) SET parameters = $parameters;",
                self.ctx.collections().job
            ))
            .bind(("id", job_id.to_string()))
            .bind(("parameters", parameters))
            .await?
            .check()?;
        Ok(())
    }

    /// Read one entry of the job's parameter map.
    pub async fn get_parameter(&self, job_id: JobId, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(job_id)
            .await?
            .and_then(|mut job| job.parameters.remove(name)))
    }
}
