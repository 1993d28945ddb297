//! Expiry sweep and counter aggregation.
//!
//! SurrealDB has no TTL eviction, so rows carrying an `expire_at` in the past
//! linger until [`ExpirationManager::sweep`] deletes them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::connection::{StoreContext, StoreError};
use crate::rows::{IdRow, record_key};

/// Raw counter rows folded per aggregation round.
pub const AGGREGATION_BATCH_SIZE: usize = 1000;

/// Rows deleted by one sweep, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: BTreeMap<String, usize>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }

    /// Rows removed from `table`.
    pub fn removed_from(&self, table: &str) -> usize {
        self.removed.get(table).copied().unwrap_or(0)
    }
}

/// Deletes expired rows.
#[derive(Debug, Clone)]
pub struct ExpirationManager {
    ctx: StoreContext,
}

impl ExpirationManager {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Delete every row whose `expire_at` lies before the store's current time.
    ///
    /// Rows without `expire_at` are never touched. State history of a swept
    /// job goes with it.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.ctx.clock().now().await?;
        let c = self.ctx.collections();
        let mut report = SweepReport::default();

        let mut response = self
            .ctx
            .db()
            .query(format!(
                "LET $expired = (SELECT VALUE record::id(id) FROM {job} WHERE expire_at != NONE AND expire_at < <datetime> $now);\n\
                 DELETE {state} WHERE job_id INSIDE $expired;\n\
                 DELETE {job} WHERE record::id(id) INSIDE $expired RETURN BEFORE;",
                job = c.job,
                state = c.state
            ))
            .bind(("now", now))
            .await?;
        let jobs: Vec<IdRow> = response.take(2)?;
        report.removed.insert(c.job.clone(), jobs.len());

        for table in [&c.counter, &c.aggregated_counter, &c.list, &c.set, &c.hash] {
            let mut response = self
                .ctx
                .db()
                .query(format!(
                    "DELETE {} WHERE expire_at != NONE AND expire_at < <datetime> $now RETURN BEFORE;",
                    table
                ))
                .bind(("now", now))
                .await?;
            let rows: Vec<IdRow> = response.take(0)?;
            report.removed.insert(table.clone(), rows.len());
        }

        if report.total() > 0 {
            tracing::debug!("Expiration sweep removed {} rows: {:?}", report.total(), report.removed);
        }
        Ok(report)
    }
}

#[derive(Debug, Deserialize)]
struct CounterRow {
    id: Thing,
    key: String,
    value: i64,
    #[serde(default)]
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct FoldedKey {
    sum: i64,
    expire_at: Option<DateTime<Utc>>,
    ids: Vec<String>,
}

/// Folds raw counter deltas into one aggregated row per key.
#[derive(Debug, Clone)]
pub struct CountersAggregator {
    ctx: StoreContext,
    batch_size: usize,
}

impl CountersAggregator {
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            ctx,
            batch_size: AGGREGATION_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fold every raw counter row. Returns the number of rows folded.
    ///
    /// Each key's upsert and the deletion of its raw rows commit together, so
    /// a counter's total never changes while it is being folded.
    pub async fn aggregate(&self) -> Result<usize, StoreError> {
        let mut folded = 0;

        loop {
            let batch = self.next_batch().await?;
            let batch_len = batch.len();
            if batch_len == 0 {
                break;
            }

            for (key, group) in group_by_key(batch) {
                self.fold_key(&key, group).await?;
            }
            folded += batch_len;

            if batch_len < self.batch_size {
                break;
            }
        }

        if folded > 0 {
            tracing::debug!("Aggregated {} counter rows", folded);
        }
        Ok(folded)
    }

    async fn next_batch(&self) -> Result<Vec<CounterRow>, StoreError> {
        let mut response = self
            .ctx
            .db()
            .query(format!(
                "SELECT id, key, value, expire_at FROM {} LIMIT $limit;",
                self.ctx.collections().counter
            ))
            .bind(("limit", self.batch_size as i64))
            .await?;
        Ok(response.take(0)?)
    }

    async fn fold_key(&self, key: &str, group: FoldedKey) -> Result<(), StoreError> {
        let c = self.ctx.collections();

        let expire_clause = if group.expire_at.is_some() {
            ", expire_at = IF expire_at = NONE OR expire_at < <datetime> $expire_at \
             THEN <datetime> $expire_at ELSE expire_at END"
        } else {
            ""
        };

        let sql = format!(
            "BEGIN TRANSACTION;\n\
             UPSERT type::thing('{agg}', $key) SET key = $key, value = (value ?? 0) + $sum{expire};\n\
             DELETE {counter} WHERE record::id(id) INSIDE $ids;\n\
             COMMIT TRANSACTION;",
            agg = c.aggregated_counter,
            counter = c.counter,
            expire = expire_clause
        );

        let mut query = self
            .ctx
            .db()
            .query(sql)
            .bind(("key", key.to_string()))
            .bind(("sum", group.sum))
            .bind(("ids", group.ids));
        if let Some(expire_at) = group.expire_at {
            query = query.bind(("expire_at", expire_at));
        }
        query.await?.check()?;
        Ok(())
    }
}

fn group_by_key(rows: Vec<CounterRow>) -> BTreeMap<String, FoldedKey> {
    let mut groups: BTreeMap<String, FoldedKey> = BTreeMap::new();
    for row in rows {
        let group = groups.entry(row.key).or_default();
        group.sum += row.value;
        group.expire_at = group.expire_at.max(row.expire_at);
        group.ids.push(record_key(&row.id));
    }
    groups
}
