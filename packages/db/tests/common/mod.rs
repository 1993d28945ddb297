#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use jobstore_core::{JobId, NewState, state_names};
use jobstore_db::{JobStorage, StorageOptions, StoreError};
use serde_json::json;

/// Options for a fresh in-memory store with a fast poll loop.
pub fn test_options() -> StorageOptions {
    StorageOptions::memory().with_poll_interval(Duration::from_millis(20))
}

/// Every `mem://` connection is its own empty store.
pub async fn setup_storage() -> Result<JobStorage, StoreError> {
    JobStorage::connect(test_options()).await
}

pub async fn setup_storage_with(options: StorageOptions) -> Result<JobStorage, StoreError> {
    JobStorage::connect(options).await
}

/// Create a job that expires in a day, with no state and no queue.
pub async fn create_job(storage: &JobStorage, method: &str) -> Result<JobId, StoreError> {
    storage
        .jobs()
        .create_expired_job(
            json!({ "type": "Demo.Jobs", "method": method, "args": ["Arguments"] }),
            HashMap::new(),
            Utc::now(),
            Duration::from_secs(24 * 60 * 60),
        )
        .await
}

/// Create a job in state Enqueued and put it into `queue`.
pub async fn enqueue_job(storage: &JobStorage, queue: &str, method: &str) -> Result<JobId, StoreError> {
    let job_id = create_job(storage, method).await?;
    let mut tx = storage.write_transaction();
    tx.set_job_state(job_id, NewState::new(state_names::ENQUEUED))
        .add_to_queue(queue, job_id);
    tx.commit().await?;
    Ok(job_id)
}

pub fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Wait until `check` holds, polling every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> Result<bool, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, StoreError>>,
{
    for _ in 0..200 {
        if check().await? {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}
