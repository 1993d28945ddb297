//! Actor system for processing stored jobs.
//!
//! This crate provides the Ractor-based actors that run on top of
//! `jobstore_db`: workers leasing jobs, periodic maintenance and the
//! per-server supervisor.
//!
//! # Architecture
//!
//! - `Supervisor` - Announces the server, heartbeats and owns its children
//! - `WorkerActor` - Leases jobs and runs their handlers
//! - `MaintenanceActor` - Sweeps expired rows and aggregates counters
//!
//! # Usage
//!
//! ```ignore
//! use jobstore_actors::{JobHandlerRegistry, JobRecord, SupervisorArgs, SupervisorMessage, start_supervisor};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register("Mailer.Send", |job: JobRecord| async move { send(&job).await });
//!
//! let args = SupervisorArgs::new(storage, handlers).with_queues(["critical", "default"]);
//! let (supervisor, handle) = start_supervisor(args).await?;
//!
//! supervisor.send_message(SupervisorMessage::Shutdown)?;
//! handle.await?;
//! ```

mod handler;
mod maintenance_actor;
mod messages;
mod supervisor;
mod worker_actor;

pub use handler::{HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry, job_type_of};
pub use maintenance_actor::{EXPIRATION_LOCK, MaintenanceActor, MaintenanceArgs, MaintenanceState};
pub use messages::{ActorError, ActorResult, MaintenanceMessage, SupervisorMessage, WorkerMessage};
pub use supervisor::{Supervisor, SupervisorArgs, SupervisorState, start_supervisor};
pub use worker_actor::{
    MAX_ATTEMPTS, RETRY_COUNT_PARAMETER, SUCCEEDED_JOB_RETENTION, WorkerActor, WorkerActorState, WorkerArgs,
};

pub use jobstore_core::JobRecord;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
