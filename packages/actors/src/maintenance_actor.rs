//! Maintenance actor for expiry sweeps and counter aggregation.

use std::time::Duration;

use jobstore_db::{JobStorage, StoreError, SweepReport};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::{ActorResult, MaintenanceMessage};

/// Lock held while sweeping so only one server sweeps at a time.
pub const EXPIRATION_LOCK: &str = "locks:expirationmanager";

/// How long a sweep waits for another server's sweep to finish.
pub const EXPIRATION_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// State for the maintenance actor.
pub struct MaintenanceState {
    pub storage: JobStorage,
    /// Sweeps completed by this actor.
    pub sweeps: u64,
    /// Raw counter rows folded by this actor.
    pub aggregated: usize,
}

/// Maintenance actor arguments.
pub struct MaintenanceArgs {
    pub storage: JobStorage,
    /// Start the periodic sweep and aggregation ticks.
    pub schedule: bool,
}

/// Maintenance actor that keeps expired rows and raw counters in check.
pub struct MaintenanceActor;

impl Actor for MaintenanceActor {
    type Msg = MaintenanceMessage;
    type State = MaintenanceState;
    type Arguments = MaintenanceArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting maintenance actor");

        if args.schedule {
            let options = args.storage.context().options();
            spawn_ticks(myself.clone(), options.job_expiration_check_interval, || {
                MaintenanceMessage::Sweep { reply: None }
            });
            spawn_ticks(myself, options.counters_aggregate_interval, || {
                MaintenanceMessage::Aggregate { reply: None }
            });
        }

        Ok(MaintenanceState {
            storage: args.storage,
            sweeps: 0,
            aggregated: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MaintenanceMessage::Sweep { reply } => {
                let result = sweep(&state.storage).await;
                match &result {
                    Ok(report) => {
                        state.sweeps += 1;
                        tracing::debug!("Sweep removed {} rows", report.total());
                    }
                    Err(e) => tracing::warn!("Sweep failed: {}", e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result.map_err(|e| e.to_string()));
                }
            }

            MaintenanceMessage::Aggregate { reply } => {
                let result = state.storage.counters_aggregator().aggregate().await;
                match &result {
                    Ok(folded) => {
                        state.aggregated += folded;
                        tracing::debug!("Aggregated {} counter rows", folded);
                    }
                    Err(e) => tracing::warn!("Counter aggregation failed: {}", e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result.map_err(|e| e.to_string()));
                }
            }

            MaintenanceMessage::Stop => {
                tracing::info!("Shutting down maintenance actor");
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Sweep under the expiration lock. A sweep already running elsewhere
/// yields an empty report.
async fn sweep(storage: &JobStorage) -> ActorResult<SweepReport> {
    let lock = match storage.acquire_lock(EXPIRATION_LOCK, EXPIRATION_LOCK_TIMEOUT).await {
        Ok(lock) => lock,
        Err(StoreError::LockTimeout(_)) => {
            tracing::debug!("Another server holds {}, skipping sweep", EXPIRATION_LOCK);
            return Ok(SweepReport::default());
        }
        Err(e) => return Err(e.into()),
    };

    let report = storage.expiration_manager().sweep().await;
    lock.release().await?;
    Ok(report?)
}

fn spawn_ticks<F>(actor: ActorRef<MaintenanceMessage>, period: Duration, message: F)
where
    F: Fn() -> MaintenanceMessage + Send + 'static,
{
    if period.is_zero() {
        tracing::warn!("Maintenance tick disabled: zero interval");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if actor.send_message(message()).is_err() {
                break;
            }
        }
    });
}
