//! Worker actor for executing jobs.

use std::sync::Arc;
use std::time::Duration;

use jobstore_core::{NewState, state_names};
use jobstore_db::monitoring::SUCCEEDED_COUNTER;
use jobstore_db::{FetchedJob, JobStorage, StoreError};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::watch;

use crate::handler::{JobHandlerRegistry, job_type_of};
use crate::messages::{ActorResult, WorkerMessage};

/// Attempts a job gets before it is marked failed.
pub const MAX_ATTEMPTS: u32 = 3;

/// Job parameter holding the number of failed attempts.
pub const RETRY_COUNT_PARAMETER: &str = "RetryCount";

/// How long a succeeded job is kept before the sweep removes it.
pub const SUCCEEDED_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    /// Server this worker belongs to.
    pub server_id: String,
    /// Queues to lease from, in priority order.
    pub queues: Vec<String>,
    pub storage: JobStorage,
    /// Handler registry.
    pub handlers: Arc<JobHandlerRegistry>,
    /// Flips to `true` on shutdown.
    pub cancel: watch::Receiver<bool>,
    /// Jobs this worker has finished, successfully or not.
    pub processed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub server_id: String,
    pub queues: Vec<String>,
    pub storage: JobStorage,
    pub handlers: Arc<JobHandlerRegistry>,
    pub cancel: watch::Receiver<bool>,
}

/// Worker actor that leases jobs and runs their handlers.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {} (queues {:?})", args.worker_id, args.queues);

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            server_id: args.server_id,
            queues: args.queues,
            storage: args.storage,
            handlers: args.handlers,
            cancel: args.cancel,
            processed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if *state.cancel.borrow() {
                    myself.stop(None);
                    return Ok(());
                }

                match state.storage.fetch_next_job(&state.queues, &state.cancel).await {
                    Ok(fetched) => {
                        let job_id = fetched.job_id();
                        if let Err(e) = process(state, fetched).await {
                            tracing::warn!("Worker {} failed to process job {}: {}", state.worker_id, job_id, e);
                        }
                        state.processed += 1;
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    Err(StoreError::Cancelled) => {
                        tracing::info!("Worker {} cancelled", state.worker_id);
                        myself.stop(None);
                    }
                    Err(e) => {
                        tracing::warn!("Worker {} could not fetch a job: {}", state.worker_id, e);
                        let delay = state.storage.context().options().queue_poll_interval;
                        let myself_clone = myself.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = myself_clone.send_message(WorkerMessage::Poll);
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Run one leased job through its handler and settle the lease.
///
/// An early return drops `fetched`, which puts the job back in its queue.
async fn process(state: &WorkerActorState, mut fetched: FetchedJob) -> ActorResult<()> {
    let job_id = fetched.job_id();
    let jobs = state.storage.jobs();

    let Some(job) = jobs.get(job_id).await? else {
        tracing::warn!("Leased job {} no longer exists", job_id);
        fetched.remove_from_queue().await?;
        return Ok(());
    };

    let mut tx = state.storage.write_transaction();
    tx.set_job_state(
        job_id,
        NewState::new(state_names::PROCESSING)
            .with_data("ServerId", state.server_id.as_str())
            .with_data("WorkerId", state.worker_id.as_str()),
    );
    tx.commit().await?;

    let Some(handler) = state.handlers.handler_for(&job) else {
        let reason = format!("No handler for job type: {}", job_type_of(&job).unwrap_or("<none>"));
        tracing::warn!("Job {}: {}", job_id, reason);
        let mut tx = state.storage.write_transaction();
        tx.set_job_state(job_id, NewState::new(state_names::FAILED).with_reason(reason));
        tx.commit().await?;
        fetched.remove_from_queue().await?;
        return Ok(());
    };

    match handler.handle(&job).await {
        Ok(()) => {
            let mut tx = state.storage.write_transaction();
            tx.set_job_state(job_id, NewState::new(state_names::SUCCEEDED))
                .increment_counter(SUCCEEDED_COUNTER)
                .expire_job(job_id, SUCCEEDED_JOB_RETENTION);
            tx.commit().await?;
            fetched.remove_from_queue().await?;
            tracing::debug!("Job {} succeeded on {}", job_id, state.worker_id);
        }
        Err(error) => {
            let attempts = jobs
                .get_parameter(job_id, RETRY_COUNT_PARAMETER)
                .await?
                .and_then(|count| count.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            jobs.set_parameter(job_id, RETRY_COUNT_PARAMETER, &attempts.to_string())
                .await?;
            tracing::warn!("Job {} failed (attempt {}): {}", job_id, attempts, error);

            let mut tx = state.storage.write_transaction();
            if attempts < MAX_ATTEMPTS {
                tx.set_job_state(
                    job_id,
                    NewState::new(state_names::ENQUEUED)
                        .with_reason(format!("Retry attempt {}: {}", attempts, error))
                        .with_data("Queue", fetched.queue()),
                );
                tx.commit().await?;
                fetched.requeue().await?;
            } else {
                tx.set_job_state(job_id, NewState::new(state_names::FAILED).with_reason(error));
                tx.commit().await?;
                fetched.remove_from_queue().await?;
            }
        }
    }

    Ok(())
}
