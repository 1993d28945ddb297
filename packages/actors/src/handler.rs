//! Handlers that run leased jobs, resolved by job type.
//!
//! The job type is the `"type"` field of a job's invocation data. A job whose
//! type has no registered handler is failed by the worker without retry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use jobstore_core::JobRecord;

/// `Err` carries the failure reason recorded on the job's state.
pub type HandlerResult = Result<(), String>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Runs one job while the worker holds its lease.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: &JobRecord) -> HandlerFuture;
}

/// Async closures taking an owned record are handlers.
impl<F, Fut> JobHandler for F
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, job: &JobRecord) -> HandlerFuture {
        Box::pin(self(job.clone()))
    }
}

/// Job type named by a job's invocation data, if any.
pub fn job_type_of(job: &JobRecord) -> Option<&str> {
    job.invocation_data.get("type").and_then(|v| v.as_str())
}

#[derive(Default)]
pub struct JobHandlerRegistry {
    by_type: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route jobs of `job_type` to `handler`, replacing any earlier one.
    pub fn register<H: JobHandler>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self {
        self.by_type.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn handler_for(&self, job: &JobRecord) -> Option<Arc<dyn JobHandler>> {
        job_type_of(job).and_then(|job_type| self.by_type.get(job_type).cloned())
    }
}
