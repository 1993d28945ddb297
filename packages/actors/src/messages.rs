//! Message types for actor communication.

use jobstore_db::{StoreError, SweepReport};
use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Lease the next job and process it.
    Poll,
}

/// Messages for the MaintenanceActor.
#[derive(Debug)]
pub enum MaintenanceMessage {
    /// Delete expired rows under the expiration lock.
    Sweep {
        reply: Option<RpcReplyPort<Result<SweepReport, String>>>,
    },

    /// Fold raw counter rows into aggregates.
    Aggregate {
        reply: Option<RpcReplyPort<Result<usize, String>>>,
    },

    /// Shutdown the maintenance actor.
    Stop,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Periodic heartbeat and dead-server cleanup.
    Tick,

    /// Stop workers, deregister the server and stop.
    Shutdown,
}

/// Result type for internal operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}
