//! Auxiliary records: counters, sets, lists, hashes, locks and servers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One signed delta; a counter's value is the sum of its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub key: String,
    pub value: i64,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Folded counter rows, one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCounterRecord {
    pub key: String,
    pub value: i64,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// A scored set member, unique per `(key, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRecord {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// A list entry; entries of one key are ordered by their id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord {
    pub id: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// A hash field, unique per `(key, field)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub key: String,
    pub field: String,
    pub value: String,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Cross-process mutual exclusion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub owner: String,
    pub expire_at: DateTime<Utc>,
}

/// A processing server registered with the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub worker_count: u32,
    #[serde(default)]
    pub queues: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
