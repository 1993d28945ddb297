//! Store-relative time.
//!
//! Lease expiry is compared across workers, so every component reads time
//! from the store instead of its local clock. The offset between the local
//! clock and the store clock is cached and refreshed periodically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::connection::{Database, StoreError};

/// How long a measured offset stays valid.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct ClockSync {
    offset: chrono::Duration,
    synced_at: Instant,
}

/// Store clock with a cached client/store offset.
#[derive(Clone)]
pub struct ServerClock {
    db: Database,
    sync: Arc<Mutex<Option<ClockSync>>>,
}

impl ServerClock {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            sync: Arc::new(Mutex::new(None)),
        }
    }

    /// Current store time in UTC.
    pub async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut sync = self.sync.lock().await;

        if let Some(cached) = *sync
            && cached.synced_at.elapsed() < SYNC_INTERVAL
        {
            return Ok(Utc::now() + cached.offset);
        }

        let server_time = self.query_server_time().await?;
        let client_time = Utc::now();
        *sync = Some(ClockSync {
            offset: server_time - client_time,
            synced_at: Instant::now(),
        });
        tracing::debug!("Synchronized store clock, offset {}ms", (server_time - client_time).num_milliseconds());

        Ok(server_time)
    }

    async fn query_server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut response = self.db.query("RETURN time::now();").await?;
        let now: Option<DateTime<Utc>> = response.take(0)?;
        now.ok_or_else(|| StoreError::Query("store returned no time".into()))
    }
}
