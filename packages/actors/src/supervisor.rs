//! Supervisor actor for one processing server.

use std::sync::Arc;
use std::time::Duration;

use jobstore_core::next_ulid;
use jobstore_db::{JobStorage, cancellation};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::watch;

use crate::handler::JobHandlerRegistry;
use crate::maintenance_actor::{MaintenanceActor, MaintenanceArgs};
use crate::messages::{MaintenanceMessage, SupervisorMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// How long shutdown waits for each child to finish its current message.
const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub storage: JobStorage,
    pub server_id: String,
    /// Queues workers lease from, in priority order.
    pub queues: Vec<String>,
    pub worker_count: usize,
    pub handlers: JobHandlerRegistry,
    pub heartbeat_interval: Duration,
    /// Servers silent for longer than this are removed on tick.
    pub server_timeout: Duration,
    /// Run the periodic sweep and aggregation ticks.
    pub maintenance: bool,
}

impl SupervisorArgs {
    pub fn new(storage: JobStorage, handlers: JobHandlerRegistry) -> Self {
        Self {
            storage,
            server_id: format!("server:{}:{}", std::process::id(), next_ulid()),
            queues: vec!["default".to_string()],
            worker_count: 5,
            handlers,
            heartbeat_interval: Duration::from_secs(30),
            server_timeout: Duration::from_secs(5 * 60),
            maintenance: true,
        }
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_maintenance(mut self, enabled: bool) -> Self {
        self.maintenance = enabled;
        self
    }
}

/// State for the supervisor actor.
pub struct SupervisorState {
    pub storage: JobStorage,
    pub server_id: String,
    pub workers: Vec<ActorRef<WorkerMessage>>,
    pub maintenance: ActorRef<MaintenanceMessage>,
    server_timeout: Duration,
    cancel_tx: watch::Sender<bool>,
    shutting_down: bool,
}

/// Supervisor actor that owns a server's workers and maintenance actor.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting server {} with {} workers on {:?}",
            args.server_id,
            args.worker_count,
            args.queues
        );

        if args.heartbeat_interval.is_zero() {
            return Err(ActorProcessingErr::from("heartbeat interval must be positive"));
        }

        args.storage
            .servers()
            .announce(&args.server_id, args.worker_count as u32, &args.queues)
            .await?;

        let (cancel_tx, cancel_rx) = cancellation();
        let handlers = Arc::new(args.handlers);

        let mut workers = Vec::with_capacity(args.worker_count);
        for i in 0..args.worker_count {
            let worker_args = WorkerArgs {
                worker_id: format!("{}:worker-{}", args.server_id, i + 1),
                server_id: args.server_id.clone(),
                queues: args.queues.clone(),
                storage: args.storage.clone(),
                handlers: handlers.clone(),
                cancel: cancel_rx.clone(),
            };
            let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, worker_args, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
            workers.push(worker);
        }

        let maintenance_args = MaintenanceArgs {
            storage: args.storage.clone(),
            schedule: args.maintenance,
        };
        let (maintenance, _handle) = Actor::spawn_linked(None, MaintenanceActor, maintenance_args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn maintenance actor: {}", e)))?;

        // Start periodic tick
        let myself_clone = myself.clone();
        let heartbeat_interval = args.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SupervisorState {
            storage: args.storage,
            server_id: args.server_id,
            workers,
            maintenance,
            server_timeout: args.server_timeout,
            cancel_tx,
            shutting_down: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Tick => {
                if state.shutting_down {
                    return Ok(());
                }

                let servers = state.storage.servers();
                if let Err(e) = servers.heartbeat(&state.server_id).await {
                    tracing::warn!("Heartbeat for {} failed: {}", state.server_id, e);
                }
                match servers.remove_timed_out(state.server_timeout).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!("Removed {} timed out servers", removed),
                    Err(e) => tracing::warn!("Timed out server cleanup failed: {}", e),
                }
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down server {}", state.server_id);
                state.shutting_down = true;

                // Wakes workers blocked waiting for work.
                let _ = state.cancel_tx.send(true);

                for worker in &state.workers {
                    // Workers usually stop on their own once cancelled.
                    if let Err(e) = worker.stop_and_wait(None, Some(CHILD_STOP_TIMEOUT)).await {
                        tracing::debug!("Worker {} already stopped: {}", worker.get_id(), e);
                    }
                }
                if let Err(e) = state
                    .maintenance
                    .stop_and_wait(None, Some(CHILD_STOP_TIMEOUT))
                    .await
                {
                    tracing::warn!("Maintenance actor did not stop cleanly: {}", e);
                }

                if let Err(e) = state.storage.servers().remove(&state.server_id).await {
                    tracing::warn!("Failed to remove server {}: {}", state.server_id, e);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) if !state.shutting_down => {
                tracing::warn!("Child actor {} terminated: {:?}", cell.get_id(), reason);
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::warn!("Child actor {} failed: {}", cell.get_id(), err);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start a supervisor for one server.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let name = format!("supervisor-{}", args.server_id);
    let (actor, handle) = Actor::spawn(Some(name), Supervisor, args).await?;

    Ok((actor, handle))
}
