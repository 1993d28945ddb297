mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobstore_core::{JobId, NewState, state_names};
use jobstore_db::queue::SurrealJobQueueMonitoringApi;
use jobstore_db::{
    AggregateKind, FetchedJob, JobQueue, JobQueueMonitoringApi, JobQueueProvider, StoreContext, StoreError,
};
use tokio::sync::watch;

use common::{create_job, setup_storage};

#[tokio::test]
async fn set_job_state_then_enqueue_applies_in_order() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = create_job(&storage, "Run").await?;

    let mut tx = storage.write_transaction();
    tx.set_job_state(
        job_id,
        NewState::new(state_names::ENQUEUED)
            .with_reason("Triggered by test")
            .with_data("Queue", "default"),
    )
    .add_to_queue("default", job_id)
    .persist_job(job_id);
    tx.commit().await?;

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.state_name.as_deref(), Some(state_names::ENQUEUED));
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.is_none());
    assert!(job.expire_at.is_none());

    let state = storage.jobs().get_state(job_id).await?.ok_or("state missing")?;
    assert_eq!(Some(&state.id), job.state_id.as_ref());
    assert_eq!(state.reason.as_deref(), Some("Triggered by test"));
    assert_eq!(state.data.get("Queue").map(String::as_str), Some("default"));
    Ok(())
}

#[tokio::test]
async fn add_job_state_only_appends_history() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = create_job(&storage, "Run").await?;

    let mut tx = storage.write_transaction();
    tx.set_job_state(job_id, NewState::new(state_names::ENQUEUED))
        .add_job_state(job_id, NewState::new(state_names::PROCESSING));
    tx.commit().await?;

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.state_name.as_deref(), Some(state_names::ENQUEUED));

    let history = storage.jobs().state_history(job_id).await?;
    let names: Vec<&str> = history.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, [state_names::PROCESSING, state_names::ENQUEUED]);
    Ok(())
}

#[tokio::test]
async fn expire_and_persist_job() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = create_job(&storage, "Run").await?;

    let mut tx = storage.write_transaction();
    tx.persist_job(job_id);
    tx.commit().await?;
    assert!(storage.jobs().get(job_id).await?.ok_or("job missing")?.expire_at.is_none());

    let now = storage.context().clock().now().await?;
    let mut tx = storage.write_transaction();
    tx.expire_job(job_id, Duration::from_secs(3600));
    tx.commit().await?;

    let expire_at = storage.jobs().get(job_id).await?.ok_or("job missing")?.expire_at.ok_or("no expiry")?;
    assert!(expire_at > now + chrono::Duration::minutes(59));
    assert!(expire_at < now + chrono::Duration::minutes(61));
    Ok(())
}

#[tokio::test]
async fn counters_sets_lists_and_hashes() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;

    let mut tx = storage.write_transaction();
    tx.increment_counter("stats:succeeded")
        .increment_counter("stats:succeeded")
        .increment_counter_expiring("stats:succeeded:today", Duration::from_secs(60))
        .decrement_counter("stats:succeeded")
        .add_to_set_with_score("schedule", "job-b", 20.0)
        .add_to_set_with_score("schedule", "job-a", 10.0)
        .add_to_set_with_score("schedule", "job-b", 5.0)
        .add_range_to_set("tags", ["x", "y", "x"])
        .insert_to_list("log", "one")
        .insert_to_list("log", "two")
        .insert_to_list("log", "three")
        .set_range_in_hash("recurring-job:nightly", [("Cron", "0 0 * * *"), ("Queue", "default")])
        .set_range_in_hash("recurring-job:nightly", [("Queue", "critical")]);
    tx.commit().await?;

    let aggregates = storage.aggregates();
    assert_eq!(aggregates.counter_value("stats:succeeded").await?, 1);
    assert_eq!(aggregates.counter_value("stats:succeeded:today").await?, 1);
    assert_eq!(aggregates.counter_value("missing").await?, 0);

    let members: Vec<String> = aggregates
        .set_members("schedule")
        .await?
        .into_iter()
        .map(|m| m.value)
        .collect();
    assert_eq!(members, ["job-b", "job-a"]);
    assert_eq!(aggregates.set_count("tags").await?, 2);
    assert_eq!(
        aggregates.first_by_lowest_score("schedule", 6.0, 100.0).await?.as_deref(),
        Some("job-a")
    );

    assert_eq!(aggregates.list_values("log").await?, ["three", "two", "one"]);

    let hash = aggregates.hash_entries("recurring-job:nightly").await?;
    assert_eq!(hash.len(), 2);
    assert_eq!(hash.get("Queue").map(String::as_str), Some("critical"));

    let mut tx = storage.write_transaction();
    tx.remove_from_set("schedule", "job-b")
        .remove_set("tags")
        .remove_from_list("log", "two")
        .remove_hash("recurring-job:nightly");
    tx.commit().await?;

    assert_eq!(aggregates.set_count("schedule").await?, 1);
    assert_eq!(aggregates.set_count("tags").await?, 0);
    assert_eq!(aggregates.list_values("log").await?, ["three", "one"]);
    assert!(aggregates.hash_entries("recurring-job:nightly").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn trim_list_keeps_newest_first_window() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;

    let mut tx = storage.write_transaction();
    for value in ["a", "b", "c", "d", "e"] {
        tx.insert_to_list("recent", value);
    }
    tx.insert_to_list("other", "keep");
    tx.trim_list("recent", 1, 2);
    tx.commit().await?;

    let aggregates = storage.aggregates();
    assert_eq!(aggregates.list_values("recent").await?, ["d", "c"]);
    assert_eq!(aggregates.list_count("other").await?, 1);

    let mut tx = storage.write_transaction();
    tx.trim_list("recent", 3, 1);
    tx.commit().await?;
    assert_eq!(aggregates.list_count("recent").await?, 0);
    assert_eq!(aggregates.list_count("other").await?, 1);
    Ok(())
}

#[tokio::test]
async fn trim_list_with_empty_or_reversed_range_clears_the_key() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let aggregates = storage.aggregates();

    let mut tx = storage.write_transaction();
    for value in ["a", "b", "c"] {
        tx.insert_to_list("first", value).insert_to_list("second", value);
    }
    tx.insert_to_list("other", "keep");
    tx.trim_list("first", 0, -1);
    tx.commit().await?;
    assert_eq!(aggregates.list_count("first").await?, 0);
    assert_eq!(aggregates.list_count("second").await?, 3);

    let mut tx = storage.write_transaction();
    tx.trim_list("second", 1, 0);
    tx.commit().await?;
    assert_eq!(aggregates.list_count("second").await?, 0);
    assert_eq!(aggregates.list_count("other").await?, 1);
    Ok(())
}

#[tokio::test]
async fn trim_list_to_the_end_keeps_the_tail() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let aggregates = storage.aggregates();

    let mut tx = storage.write_transaction();
    for value in ["a", "b", "c"] {
        tx.insert_to_list("history", value);
    }
    tx.trim_list("history", 0, i64::MAX);
    tx.commit().await?;
    assert_eq!(aggregates.list_values("history").await?, ["c", "b", "a"]);

    let mut tx = storage.write_transaction();
    tx.trim_list("history", 1, i64::MAX);
    tx.commit().await?;
    assert_eq!(aggregates.list_values("history").await?, ["b", "a"]);
    Ok(())
}

#[tokio::test]
async fn aggregate_expiry_can_be_set_and_cleared() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;

    let mut tx = storage.write_transaction();
    tx.add_to_set("s", "member")
        .insert_to_list("l", "entry")
        .set_range_in_hash("h", [("field", "value")])
        .expire(AggregateKind::Set, "s", Duration::ZERO)
        .expire(AggregateKind::List, "l", Duration::ZERO)
        .expire(AggregateKind::Hash, "h", Duration::ZERO)
        .persist(AggregateKind::List, "l");
    tx.commit().await?;

    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = storage.expiration_manager().sweep().await?;
    let c = storage.context().collections();
    assert_eq!(report.removed_from(&c.set), 1);
    assert_eq!(report.removed_from(&c.hash), 1);
    assert_eq!(report.removed_from(&c.list), 0);
    assert_eq!(storage.aggregates().list_values("l").await?, ["entry"]);
    Ok(())
}

struct FailingQueue;

#[async_trait]
impl JobQueue for FailingQueue {
    async fn dequeue(&self, _queues: &[String], _cancel: &watch::Receiver<bool>) -> Result<FetchedJob, StoreError> {
        Err(StoreError::Query("continuation queue offline".into()))
    }

    async fn enqueue(&self, _queue: &str, _job_id: JobId) -> Result<(), StoreError> {
        Err(StoreError::Query("continuation queue offline".into()))
    }
}

struct FailingProvider;

impl JobQueueProvider for FailingProvider {
    fn job_queue(&self, _ctx: &StoreContext) -> Arc<dyn JobQueue> {
        Arc::new(FailingQueue)
    }

    fn monitoring_api(&self, ctx: &StoreContext) -> Arc<dyn JobQueueMonitoringApi> {
        Arc::new(SurrealJobQueueMonitoringApi::new(ctx.clone()))
    }
}

#[tokio::test]
async fn commit_stops_at_first_failure_and_keeps_earlier_commands() -> Result<(), Box<dyn Error>> {
    let mut storage = setup_storage().await?;
    storage.add_provider(Arc::new(FailingProvider), ["continuations"]);
    let job_id = create_job(&storage, "Continue").await?;

    let mut tx = storage.write_transaction();
    tx.add_job_state(job_id, NewState::new(state_names::AWAITING))
        .add_to_queue("continuations", job_id)
        .increment_counter("after-failure");
    let result = tx.commit().await;

    match result {
        Err(StoreError::CommitFailed { index, source }) => {
            assert_eq!(index, 1);
            assert!(matches!(*source, StoreError::Query(_)));
        }
        other => panic!("expected CommitFailed, got {:?}", other.map(|_| ())),
    }

    let history = storage.jobs().state_history(job_id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, state_names::AWAITING);

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert!(job.queue.is_none());
    assert_eq!(storage.aggregates().counter_value("after-failure").await?, 0);
    Ok(())
}

#[tokio::test]
async fn fetch_rejects_queues_served_by_different_providers() -> Result<(), Box<dyn Error>> {
    let mut storage = setup_storage().await?;
    storage.add_provider(Arc::new(FailingProvider), ["continuations"]);
    let (_tx, cancel) = jobstore_db::cancellation();

    let mixed = storage
        .fetch_next_job(&["default".to_string(), "continuations".to_string()], &cancel)
        .await;
    assert!(matches!(mixed, Err(StoreError::InvalidArgument(_))));
    Ok(())
}
