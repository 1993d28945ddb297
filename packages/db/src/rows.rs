//! Internal record types for SurrealDB reads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobstore_core::{JobId, JobRecord, StateRecord};
use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::connection::StoreError;

/// Raw key of a record id (`job:⟨01H…⟩` → `01H…`).
pub(crate) fn record_key(thing: &Thing) -> String {
    thing.id.to_raw()
}

pub(crate) fn parse_job_id(raw: &str) -> Result<JobId, StoreError> {
    JobId::parse(raw).map_err(|e| StoreError::Query(format!("invalid job id {:?}: {}", raw, e)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdRow {
    pub id: Thing,
}

impl IdRow {
    pub fn job_id(&self) -> Result<JobId, StoreError> {
        parse_job_id(&record_key(&self.id))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CountRow {
    pub count: i64,
}

/// Sum of `count` rows, treating no rows as zero.
pub(crate) fn first_count(rows: Vec<CountRow>) -> u64 {
    rows.first().map_or(0, |row| row.count.max(0) as u64)
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobRow {
    id: Thing,
    #[serde(default)]
    state_id: Option<String>,
    #[serde(default)]
    state_name: Option<String>,
    #[serde(default)]
    invocation_data: serde_json::Value,
    created_at: DateTime<Utc>,
    #[serde(default)]
    expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    parameters: HashMap<String, String>,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    fetched_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_record(self) -> Result<JobRecord, StoreError> {
        Ok(JobRecord {
            id: parse_job_id(&record_key(&self.id))?,
            state_id: self.state_id,
            state_name: self.state_name,
            invocation_data: self.invocation_data,
            created_at: self.created_at,
            expire_at: self.expire_at,
            parameters: self.parameters,
            queue: self.queue,
            fetched_at: self.fetched_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StateRow {
    id: Thing,
    job_id: String,
    name: String,
    #[serde(default)]
    reason: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    data: HashMap<String, String>,
}

impl StateRow {
    pub fn into_record(self) -> Result<StateRecord, StoreError> {
        Ok(StateRecord {
            id: record_key(&self.id),
            job_id: parse_job_id(&self.job_id)?,
            name: self.name,
            reason: self.reason,
            created_at: self.created_at,
            data: self.data,
        })
    }
}

pub(crate) fn into_records<R, T>(
    rows: Vec<R>,
    convert: impl Fn(R) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.into_iter().map(convert).collect()
}
