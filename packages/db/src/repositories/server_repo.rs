//! Processing-server registrations and heartbeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobstore_core::ServerRecord;
use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::connection::{StoreContext, StoreError, chrono_duration};
use crate::rows::{IdRow, record_key};

/// Repository for server records.
#[derive(Debug, Clone)]
pub struct ServerRepository {
    ctx: StoreContext,
}

#[derive(Debug, Deserialize)]
struct ServerRow {
    id: Thing,
    worker_count: u32,
    #[serde(default)]
    queues: Vec<String>,
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl From<ServerRow> for ServerRecord {
    fn from(row: ServerRow) -> Self {
        ServerRecord {
            id: record_key(&row.id),
            worker_count: row.worker_count,
            queues: row.queues,
            started_at: row.started_at,
            last_heartbeat: row.last_heartbeat,
        }
    }
}

impl ServerRepository {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Register (or re-register) a server.
    pub async fn announce(&self, server_id: &str, worker_count: u32, queues: &[String]) -> Result<(), StoreError> {
        if server_id.is_empty() {
            return Err(StoreError::InvalidArgument("server id must be non-empty".into()));
        }

        self.ctx
            .db()
            .query(format!(
                "UPSERT type::thing('{}', $id) SET worker_count = $worker_count, queues = $queues, \
                 started_at = time::now(), last_heartbeat = time::now();",
                self.ctx.collections().server
            ))
            .bind(("id", server_id.to_string()))
            .bind(("worker_count", worker_count))
            .bind(("queues", queues.to_vec()))
            .await?
            .check()?;

        tracing::info!("Announced server {} with {} workers", server_id, worker_count);
        Ok(())
    }

    pub async fn heartbeat(&self, server_id: &str) -> Result<(), StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "UPDATE type::thing('{}', $id) SET last_heartbeat = time::now() RETURN id;",
                self.ctx.collections().server
            ))
            .bind(("id", server_id.to_string()))
            .await?;

        let rows: Vec<IdRow> = response.take(0)?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("Server not found: {}", server_id)));
        }
        Ok(())
    }

    pub async fn remove(&self, server_id: &str) -> Result<(), StoreError> {
        self.ctx
            .db()
            .query(format!("DELETE type::thing('{}', $id);", self.ctx.collections().server))
            .bind(("id", server_id.to_string()))
            .await?
            .check()?;

        tracing::info!("Removed server {}", server_id);
        Ok(())
    }

    /// Delete servers whose last heartbeat is older than `timeout`.
    pub async fn remove_timed_out(&self, timeout: Duration) -> Result<usize, StoreError> {
        let cutoff = self.ctx.clock().now().await? - chrono_duration(timeout);

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "DELETE {} WHERE last_heartbeat < <datetime> $cutoff RETURN BEFORE;",
                self.ctx.collections().server
            ))
            .bind(("cutoff", cutoff))
            .await?;

        let removed: Vec<IdRow> = response.take(0)?;
        if !removed.is_empty() {
            tracing::info!("Removed {} timed-out servers", removed.len());
        }
        Ok(removed.len())
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!("SELECT * FROM {} ORDER BY id ASC;", self.ctx.collections().server))
            .await?;

        let rows: Vec<ServerRow> = response.take(0)?;
        Ok(rows.into_iter().map(ServerRecord::from).collect())
    }
}
