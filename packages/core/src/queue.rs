//! Read-side projections returned by the monitoring API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, StateRecord};

/// Number of waiting and leased jobs in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueuedAndFetchedCount {
    pub enqueued: u64,
    pub fetched: u64,
}

impl EnqueuedAndFetchedCount {
    /// Total jobs assigned to the queue.
    pub fn total(&self) -> u64 {
        self.enqueued + self.fetched
    }
}

/// Store-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    /// Job counts keyed by current state name.
    pub by_state: HashMap<String, u64>,
    pub enqueued: u64,
    pub failed: u64,
    pub processing: u64,
    pub scheduled: u64,
    /// Historical totals from the `stats:succeeded` counter.
    pub succeeded: i64,
    /// Historical totals from the `stats:deleted` counter.
    pub deleted: i64,
    pub servers: u64,
    pub queues: u64,
    pub recurring: u64,
}

impl Statistics {
    /// Total processed jobs.
    pub fn processed(&self) -> i64 {
        self.succeeded + self.failed as i64
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total <= 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }
}

/// A waiting job as shown in queue listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuedJob {
    pub job_id: JobId,
    pub invocation_data: serde_json::Value,
    #[serde(default)]
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the job entered its current state.
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
}

/// A leased job as shown in queue listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedJobSummary {
    pub job_id: JobId,
    pub invocation_data: serde_json::Value,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Queue overview with the first few waiting jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOverview {
    pub name: String,
    pub length: u64,
    pub fetched: u64,
    pub first_jobs: Vec<EnqueuedJob>,
}

/// Full job detail with state history, newest entry first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub job_id: JobId,
    pub invocation_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub state_name: Option<String>,
    pub history: Vec<StateRecord>,
}

/// A job listed by its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub invocation_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub state_name: String,
    #[serde(default)]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub state_data: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_needs_processed_jobs() {
        let empty = Statistics::default();
        assert_eq!(empty.success_rate(), None);

        let stats = Statistics {
            succeeded: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.processed(), 4);
        assert_eq!(stats.success_rate(), Some(75.0));
    }
}
