//! Core record types for the job storage backend.
//!
//! This crate contains the persisted entities shared across all packages:
//! - Job records and identifiers
//! - State-history entries and the state objects that produce them
//! - Auxiliary counters, sets, lists, hashes, locks and servers
//! - Read-side projections for monitoring

mod aggregate;
mod job;
mod queue;
mod state;

pub use aggregate::{
    AggregatedCounterRecord, CounterRecord, HashRecord, ListRecord, LockRecord, ServerRecord,
    SetRecord,
};
pub use job::{JobId, JobRecord, next_ulid};
pub use queue::{
    EnqueuedAndFetchedCount, EnqueuedJob, FetchedJobSummary, JobDetails, JobSummary,
    QueueOverview, Statistics,
};
pub use state::{NewState, StateRecord, names as state_names};
