mod common;

use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use jobstore_core::JobId;
use jobstore_db::{StoreError, cancellation};

use common::{create_job, enqueue_job, eventually, queues, setup_storage, setup_storage_with, test_options};

#[tokio::test]
async fn dequeue_leases_a_waiting_job() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = enqueue_job(&storage, "default", "Run").await?;
    let (_tx, cancel) = cancellation();

    let before = Utc::now() - chrono::Duration::seconds(1);
    let fetched = storage.fetch_next_job(&queues(&["default"]), &cancel).await?;

    assert_eq!(fetched.job_id(), job_id);
    assert_eq!(fetched.queue(), "default");

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.ok_or("job not leased")? >= before);

    Ok(())
}

#[tokio::test]
async fn concurrent_dequeues_never_share_a_job() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let mut expected = HashSet::new();
    for i in 0..6 {
        expected.insert(enqueue_job(&storage, "default", &format!("Run{}", i)).await?);
    }
    let (_tx, cancel) = cancellation();
    let names = queues(&["default"]);

    let attempts = (0..6).map(|_| storage.fetch_next_job(&names, &cancel));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(attempts)).await?;

    let mut leased = HashSet::new();
    let mut guards = Vec::new();
    for result in results {
        let fetched = result?;
        assert!(leased.insert(fetched.job_id()), "job {} leased twice", fetched.job_id());
        guards.push(fetched);
    }
    assert_eq!(leased, expected);

    for guard in guards {
        guard.dispose().await?;
    }
    Ok(())
}

#[tokio::test]
async fn abandoned_lease_becomes_visible_after_invisibility_timeout() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage_with(test_options().with_invisibility_timeout(Duration::from_millis(200))).await?;
    let job_id = enqueue_job(&storage, "default", "Crash").await?;
    let (tx, cancel) = cancellation();
    let names = queues(&["default"]);

    let first = storage.fetch_next_job(&names, &cancel).await?;
    // Simulate a worker that died without releasing its lease.
    std::mem::forget(first);

    let (_tx2, other_cancel) = cancellation();
    let early = tokio::time::timeout(Duration::from_millis(50), storage.fetch_next_job(&names, &other_cancel)).await;
    assert!(early.is_err(), "lease should still be valid");

    tokio::time::sleep(Duration::from_millis(250)).await;
    let second = storage.fetch_next_job(&names, &other_cancel).await?;
    assert_eq!(second.job_id(), job_id);

    second.dispose().await?;
    drop(tx);
    Ok(())
}

#[tokio::test]
async fn dropping_a_lease_requeues_the_job() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = enqueue_job(&storage, "default", "Run").await?;
    let (_tx, cancel) = cancellation();

    {
        let fetched = storage.fetch_next_job(&queues(&["default"]), &cancel).await?;
        assert_eq!(fetched.job_id(), job_id);
    }

    let jobs = storage.jobs();
    let released = eventually(|| {
        let jobs = jobs.clone();
        async move {
            let job = jobs.get(job_id).await?;
            Ok(job.is_some_and(|job| job.fetched_at.is_none()))
        }
    })
    .await?;
    assert!(released, "dropped lease was not released");

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.queue.as_deref(), Some("default"));
    Ok(())
}

#[tokio::test]
async fn dispose_without_terminal_call_requeues() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = enqueue_job(&storage, "default", "Run").await?;
    let (_tx, cancel) = cancellation();

    let fetched = storage.fetch_next_job(&queues(&["default"]), &cancel).await?;
    fetched.dispose().await?;

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.is_none());
    Ok(())
}

#[tokio::test]
async fn remove_from_queue_clears_queue_and_lease() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = enqueue_job(&storage, "default", "Run").await?;
    let names = queues(&["default"]);
    let (_tx, cancel) = cancellation();

    let mut fetched = storage.fetch_next_job(&names, &cancel).await?;
    fetched.remove_from_queue().await?;
    assert!(fetched.is_removed_from_queue());

    // Later terminal calls are no-ops.
    fetched.requeue().await?;
    assert!(!fetched.is_requeued());
    fetched.dispose().await?;

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert!(job.queue.is_none());
    assert!(job.fetched_at.is_none());

    let (tx, cancel) = cancellation();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(true);
    });
    let again = storage.fetch_next_job(&names, &cancel).await;
    assert!(matches!(again, Err(StoreError::Cancelled)));
    canceller.await?;
    Ok(())
}

#[tokio::test]
async fn requeue_makes_the_job_claimable_again() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let job_id = enqueue_job(&storage, "default", "Run").await?;
    let names = queues(&["default"]);
    let (_tx, cancel) = cancellation();

    let mut fetched = storage.fetch_next_job(&names, &cancel).await?;
    fetched.requeue().await?;
    assert!(fetched.is_requeued());

    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.is_none());

    let again = storage.fetch_next_job(&names, &cancel).await?;
    assert_eq!(again.job_id(), job_id);
    again.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn earlier_queues_take_priority() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let default_job = enqueue_job(&storage, "default", "Old").await?;
    let critical_job = enqueue_job(&storage, "critical", "Urgent").await?;
    let names = queues(&["critical", "default"]);
    let (_tx, cancel) = cancellation();

    let first = storage.fetch_next_job(&names, &cancel).await?;
    assert_eq!(first.job_id(), critical_job);
    assert_eq!(first.queue(), "critical");

    let second = storage.fetch_next_job(&names, &cancel).await?;
    assert_eq!(second.job_id(), default_job);
    assert_eq!(second.queue(), "default");

    first.dispose().await?;
    second.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn critical_jobs_drain_before_older_default_jobs() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let j3 = enqueue_job(&storage, "default", "Oldest").await?;
    let j1 = enqueue_job(&storage, "critical", "UrgentA").await?;
    let j2 = enqueue_job(&storage, "critical", "UrgentB").await?;
    let names = queues(&["critical", "default"]);
    let (_tx, cancel) = cancellation();

    let first = storage.fetch_next_job(&names, &cancel).await?;
    let second = storage.fetch_next_job(&names, &cancel).await?;
    let third = storage.fetch_next_job(&names, &cancel).await?;

    let critical: HashSet<JobId> = [first.job_id(), second.job_id()].into_iter().collect();
    assert_eq!(critical, [j1, j2].into_iter().collect::<HashSet<_>>());
    assert_eq!(third.job_id(), j3);
    assert_eq!(third.queue(), "default");

    for fetched in [first, second, third] {
        fetched.dispose().await?;
    }
    Ok(())
}

#[tokio::test]
async fn jobs_in_one_queue_come_out_oldest_first() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let mut created: Vec<JobId> = Vec::new();
    for i in 0..3 {
        created.push(enqueue_job(&storage, "default", &format!("Run{}", i)).await?);
    }
    let names = queues(&["default"]);
    let (_tx, cancel) = cancellation();

    let mut leased = Vec::new();
    let mut guards = Vec::new();
    for _ in 0..3 {
        let mut fetched = storage.fetch_next_job(&names, &cancel).await?;
        leased.push(fetched.job_id());
        fetched.remove_from_queue().await?;
        guards.push(fetched);
    }
    assert_eq!(leased, created);
    Ok(())
}

#[tokio::test]
async fn dequeue_rejects_bad_queue_lists() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let (_tx, cancel) = cancellation();

    let empty = storage.fetch_next_job(&[], &cancel).await;
    assert!(matches!(empty, Err(StoreError::InvalidArgument(_))));

    let blank = storage.fetch_next_job(&queues(&["default", ""]), &cancel).await;
    assert!(matches!(blank, Err(StoreError::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn dequeue_honours_cancellation() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    enqueue_job(&storage, "default", "Run").await?;
    let names = queues(&["default"]);

    // Already cancelled: fails even though work is available.
    let (tx, cancel) = cancellation();
    tx.send(true)?;
    let result = storage.fetch_next_job(&names, &cancel).await;
    assert!(matches!(result, Err(StoreError::Cancelled)));

    // Cancelled while waiting on an empty queue.
    let (tx, cancel) = cancellation();
    let waiter = {
        let storage = storage.clone();
        tokio::spawn(async move { storage.fetch_next_job(&queues(&["empty"]), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(true)?;
    let result = tokio::time::timeout(Duration::from_secs(2), waiter).await??;
    assert!(matches!(result, Err(StoreError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn waiting_dequeue_picks_up_new_work() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;
    let (_tx, cancel) = cancellation();

    let waiter = {
        let storage = storage.clone();
        tokio::spawn(async move { storage.fetch_next_job(&queues(&["default"]), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job_id = enqueue_job(&storage, "default", "Late").await?;

    let fetched = tokio::time::timeout(Duration::from_secs(2), waiter).await???;
    assert_eq!(fetched.job_id(), job_id);
    fetched.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn enqueue_requires_an_existing_job() -> Result<(), Box<dyn Error>> {
    let storage = setup_storage().await?;

    let missing = storage.enqueue("default", JobId::new()).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));

    let job_id = create_job(&storage, "Run").await?;
    storage.enqueue("default", job_id).await?;
    let job = storage.jobs().get(job_id).await?.ok_or("job missing")?;
    assert!(job.is_enqueued());
    assert!(!job.is_fetched());
    Ok(())
}
