//! Job records and their identifiers.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

/// Process-wide monotonic ULID source.
static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Generate a ULID that sorts after every ULID previously generated by this process.
///
/// List entries are ordered by identifier, so ids minted within the same
/// millisecond must still increase.
pub fn next_ulid() -> Ulid {
    match GENERATOR.lock() {
        Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
        Err(_) => Ulid::new(),
    }
}

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(next_ulid())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted unit of work.
///
/// `queue` and `fetched_at` together describe the queue position:
/// no queue means the job is not enqueued (and can't be leased), a queue
/// without `fetched_at` means the job is claimable, and both set means a
/// worker holds a lease on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Latest state-history entry for this job.
    #[serde(default)]
    pub state_id: Option<String>,
    #[serde(default)]
    pub state_name: Option<String>,
    /// Invocation descriptor, opaque to the store.
    pub invocation_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Absent means the job never expires.
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub queue: Option<String>,
    /// Lease timestamp, set by the store clock when a worker claims the job.
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Check if the job sits in a queue.
    pub fn is_enqueued(&self) -> bool {
        self.queue.is_some()
    }

    /// Check if a worker currently holds (or held) a lease on the job.
    pub fn is_fetched(&self) -> bool {
        self.queue.is_some() && self.fetched_at.is_some()
    }
}
