//! Lease handle returned by a dequeue.

use jobstore_core::JobId;

use crate::connection::{StoreContext, StoreError};

/// A leased job.
///
/// While the handle is held, the job is invisible to other workers until the
/// invisibility timeout passes. Exactly one of [`remove_from_queue`] or
/// [`requeue`] should be called; if neither was, [`dispose`] (or dropping the
/// handle) puts the job back.
///
/// [`remove_from_queue`]: FetchedJob::remove_from_queue
/// [`requeue`]: FetchedJob::requeue
/// [`dispose`]: FetchedJob::dispose
#[derive(Debug)]
pub struct FetchedJob {
    ctx: StoreContext,
    job_id: JobId,
    queue: String,
    removed_from_queue: bool,
    requeued: bool,
}

impl FetchedJob {
    pub fn new(ctx: StoreContext, job_id: JobId, queue: impl Into<String>) -> Result<Self, StoreError> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(StoreError::InvalidArgument("fetched job needs a queue name".into()));
        }
        Ok(Self {
            ctx,
            job_id,
            queue,
            removed_from_queue: false,
            requeued: false,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_removed_from_queue(&self) -> bool {
        self.removed_from_queue
    }

    pub fn is_requeued(&self) -> bool {
        self.requeued
    }

    /// Take the job out of its queue for good.
    pub async fn remove_from_queue(&mut self) -> Result<(), StoreError> {
        if self.removed_from_queue || self.requeued {
            return Ok(());
        }
        remove(&self.ctx, self.job_id).await?;
        self.removed_from_queue = true;
        tracing::debug!("Removed job {} from queue {}", self.job_id, self.queue);
        Ok(())
    }

    /// Release the lease so the job can be claimed again right away.
    pub async fn requeue(&mut self) -> Result<(), StoreError> {
        if self.removed_from_queue || self.requeued {
            return Ok(());
        }
        release(&self.ctx, self.job_id).await?;
        self.requeued = true;
        tracing::debug!("Requeued job {} in queue {}", self.job_id, self.queue);
        Ok(())
    }

    /// Requeue unless the lease was already resolved.
    pub async fn dispose(mut self) -> Result<(), StoreError> {
        self.requeue().await
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.removed_from_queue || self.requeued {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = self.ctx.clone();
                let job_id = self.job_id;
                handle.spawn(async move {
                    if let Err(e) = release(&ctx, job_id).await {
                        tracing::warn!("Failed to requeue dropped job {}: {}", job_id, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Job {} dropped outside a runtime; lease ends after the invisibility timeout",
                    self.job_id
                );
            }
        }
    }
}

async fn remove(ctx: &StoreContext, job_id: JobId) -> Result<(), StoreError> {
    ctx.db()
        .query(format!(
            "UPDATE type::thing('{}', $id) SET queue = NONE, fetched_at = NONE;",
            ctx.collections().job
        ))
        .bind(("id", job_id.to_string()))
        .await?
        .check()?;
    Ok(())
}

async fn release(ctx: &StoreContext, job_id: JobId) -> Result<(), StoreError> {
    ctx.db()
        .query(format!(
            "UPDATE type::thing('{}', $id) SET fetched_at = NONE;",
            ctx.collections().job
        ))
        .bind(("id", job_id.to_string()))
        .await?
        .check()?;
    Ok(())
}
