//! Store-backed mutual exclusion between processes.

use std::time::Duration;

use jobstore_core::next_ulid;
use tokio::time::Instant;

use crate::connection::{StoreContext, StoreError, chrono_duration};

/// Delay between attempts on a held lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A held lock on one resource name.
///
/// The lock record carries an expiry (`distributed_lock_lifetime`), after
/// which another caller may break it. Release with [`DistributedLock::release`];
/// dropping the handle releases it in the background.
#[derive(Debug)]
pub struct DistributedLock {
    ctx: StoreContext,
    resource: String,
    owner: String,
    released: bool,
}

impl DistributedLock {
    /// Acquire `resource`, waiting up to `timeout` for a live holder to let go.
    pub async fn acquire(ctx: StoreContext, resource: &str, timeout: Duration) -> Result<Self, StoreError> {
        if resource.is_empty() {
            return Err(StoreError::InvalidArgument("lock resource must be non-empty".into()));
        }

        let owner = next_ulid().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match try_create(&ctx, resource, &owner).await {
                Ok(()) => {
                    tracing::debug!("Acquired lock {} as {}", resource, owner);
                    return Ok(Self {
                        ctx,
                        resource: resource.to_string(),
                        owner,
                        released: false,
                    });
                }
                Err(e) if e.is_record_exists() || e.is_write_conflict() => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(resource.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Delete the lock record if this handle still owns it.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        delete_own(&self.ctx, &self.resource, &self.owner).await?;
        tracing::debug!("Released lock {}", self.resource);
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = self.ctx.clone();
                let resource = std::mem::take(&mut self.resource);
                let owner = std::mem::take(&mut self.owner);
                handle.spawn(async move {
                    if let Err(e) = delete_own(&ctx, &resource, &owner).await {
                        tracing::warn!("Failed to release dropped lock {}: {}", resource, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Lock {} dropped outside a runtime; it will expire on its own", self.resource);
            }
        }
    }
}

/// Clear an expired holder, then try to create the lock record.
async fn try_create(ctx: &StoreContext, resource: &str, owner: &str) -> Result<(), StoreError> {
    let now = ctx.clock().now().await?;
    let expire_at = now + chrono_duration(ctx.options().distributed_lock_lifetime);

    ctx.db()
        .query(format!(
            "DELETE type::thing('{0}', $resource) WHERE expire_at < <datetime> $now;\n\
             CREATE type::thing('{0}', $resource) SET resource = $resource, owner = $owner, \
             expire_at = <datetime> $expire_at;",
            ctx.collections().locks
        ))
        .bind(("resource", resource.to_string()))
        .bind(("owner", owner.to_string()))
        .bind(("now", now))
        .bind(("expire_at", expire_at))
        .await?
        .check()?;
    Ok(())
}

async fn delete_own(ctx: &StoreContext, resource: &str, owner: &str) -> Result<(), StoreError> {
    ctx.db()
        .query(format!(
            "DELETE type::thing('{}', $resource) WHERE owner = $owner;",
            ctx.collections().locks
        ))
        .bind(("resource", resource.to_string()))
        .bind(("owner", owner.to_string()))
        .await?
        .check()?;
    Ok(())
}
