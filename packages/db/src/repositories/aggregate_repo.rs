//! Read access to counters, sets, lists and hashes.

use std::collections::HashMap;

use jobstore_core::SetRecord;
use serde::Deserialize;

use crate::connection::{StoreContext, StoreError};
use crate::rows::{CountRow, first_count};

/// Repository for keyed aggregate reads.
#[derive(Debug, Clone)]
pub struct AggregateRepository {
    ctx: StoreContext,
}

#[derive(Debug, Deserialize)]
struct ValueRow {
    value: String,
}

#[derive(Debug, Deserialize)]
struct HashEntryRow {
    field: String,
    value: String,
}

impl AggregateRepository {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Current counter value: raw deltas plus the aggregated total.
    pub async fn counter_value(&self, key: &str) -> Result<i64, StoreError> {
        let c = self.ctx.collections();
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "RETURN math::sum((SELECT VALUE value FROM {} WHERE key = $key)) \
                 + math::sum((SELECT VALUE value FROM {} WHERE key = $key));",
                c.counter, c.aggregated_counter
            ))
            .bind(("key", key.to_string()))
            .await?;

        let total: Option<i64> = response.take(0)?;
        Ok(total.unwrap_or(0))
    }

    /// Set members ordered by score, then value.
    pub async fn set_members(&self, key: &str) -> Result<Vec<SetRecord>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT key, value, score, expire_at FROM {} WHERE key = $key ORDER BY score ASC, value ASC;",
                self.ctx.collections().set
            ))
            .bind(("key", key.to_string()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn set_count(&self, key: &str) -> Result<u64, StoreError> {
        self.count_by_key(&self.ctx.collections().set, key).await
    }

    /// The lowest-scored member with `from <= score <= to`.
    pub async fn first_by_lowest_score(&self, key: &str, from: f64, to: f64) -> Result<Option<String>, StoreError> {
        if from > to {
            return Err(StoreError::InvalidArgument(format!(
                "score range is empty: {} > {}",
                from, to
            )));
        }

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT value, score FROM {} WHERE key = $key AND score >= $from AND score <= $to \
                 ORDER BY score ASC LIMIT 1;",
                self.ctx.collections().set
            ))
            .bind(("key", key.to_string()))
            .bind(("from", from))
            .bind(("to", to))
            .await?;

        let rows: Vec<ValueRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.value))
    }

    /// List values, newest first.
    pub async fn list_values(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT id, value FROM {} WHERE key = $key ORDER BY id DESC;",
                self.ctx.collections().list
            ))
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<ValueRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.value).collect())
    }

    pub async fn list_count(&self, key: &str) -> Result<u64, StoreError> {
        self.count_by_key(&self.ctx.collections().list, key).await
    }

    pub async fn hash_entries(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT field, value FROM {} WHERE key = $key;",
                self.ctx.collections().hash
            ))
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<HashEntryRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| (row.field, row.value)).collect())
    }

    async fn count_by_key(&self, table: &str, key: &str) -> Result<u64, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!("SELECT count() AS count FROM {} WHERE key = $key GROUP ALL;", table))
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<CountRow> = response.take(0)?;
        Ok(first_count(rows))
    }
}
