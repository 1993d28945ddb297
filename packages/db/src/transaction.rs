//! Write-only transaction: a queue of mutations applied on commit.
//!
//! Nothing touches the store until [`WriteOnlyTransaction::commit`]. Commands
//! then run one by one in the order they were queued. The store offers no
//! rollback across commands, so a failure leaves every earlier command applied
//! and skips every later one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobstore_core::{JobId, NewState, next_ulid};

use crate::connection::{StoreContext, StoreError, chrono_duration};
use crate::queue::QueueProviders;

/// Which keyed aggregate an expire/persist command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Set,
    List,
    Hash,
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ExpireJob { job_id: JobId, expire_in: Duration },
    PersistJob { job_id: JobId },
    SetJobState { job_id: JobId, state: NewState },
    AddJobState { job_id: JobId, state: NewState },
    AddToQueue { queue: String, job_id: JobId },
    IncrementCounter { key: String, expire_in: Option<Duration> },
    DecrementCounter { key: String, expire_in: Option<Duration> },
    AddToSet { key: String, value: String, score: f64 },
    AddRangeToSet { key: String, values: Vec<String> },
    RemoveFromSet { key: String, value: String },
    RemoveSet { key: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_from: i64, keep_to: i64 },
    SetRangeInHash { key: String, entries: Vec<(String, String)> },
    RemoveHash { key: String },
    ExpireSet { key: String, expire_in: Duration },
    ExpireList { key: String, expire_in: Duration },
    ExpireHash { key: String, expire_in: Duration },
    PersistSet { key: String },
    PersistList { key: String },
    PersistHash { key: String },
}

impl Command {
    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ExpireJob { .. } => "ExpireJob",
            Command::PersistJob { .. } => "PersistJob",
            Command::SetJobState { .. } => "SetJobState",
            Command::AddJobState { .. } => "AddJobState",
            Command::AddToQueue { .. } => "AddToQueue",
            Command::IncrementCounter { .. } => "IncrementCounter",
            Command::DecrementCounter { .. } => "DecrementCounter",
            Command::AddToSet { .. } => "AddToSet",
            Command::AddRangeToSet { .. } => "AddRangeToSet",
            Command::RemoveFromSet { .. } => "RemoveFromSet",
            Command::RemoveSet { .. } => "RemoveSet",
            Command::InsertToList { .. } => "InsertToList",
            Command::RemoveFromList { .. } => "RemoveFromList",
            Command::TrimList { .. } => "TrimList",
            Command::SetRangeInHash { .. } => "SetRangeInHash",
            Command::RemoveHash { .. } => "RemoveHash",
            Command::ExpireSet { .. } => "ExpireSet",
            Command::ExpireList { .. } => "ExpireList",
            Command::ExpireHash { .. } => "ExpireHash",
            Command::PersistSet { .. } => "PersistSet",
            Command::PersistList { .. } => "PersistList",
            Command::PersistHash { .. } => "PersistHash",
        }
    }
}

/// Batch of store mutations, applied in FIFO order on commit.
pub struct WriteOnlyTransaction {
    ctx: StoreContext,
    providers: QueueProviders,
    commands: Vec<Command>,
}

impl WriteOnlyTransaction {
    pub fn new(ctx: StoreContext, providers: QueueProviders) -> Self {
        Self {
            ctx,
            providers,
            commands: Vec::new(),
        }
    }

    /// Commands queued so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Append a raw command.
    pub fn queue_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn expire_job(&mut self, job_id: JobId, expire_in: Duration) -> &mut Self {
        self.queue_command(Command::ExpireJob { job_id, expire_in })
    }

    pub fn persist_job(&mut self, job_id: JobId) -> &mut Self {
        self.queue_command(Command::PersistJob { job_id })
    }

    /// Append a history entry and make it the job's current state.
    pub fn set_job_state(&mut self, job_id: JobId, state: NewState) -> &mut Self {
        self.queue_command(Command::SetJobState { job_id, state })
    }

    /// Append a history entry without changing the current state.
    pub fn add_job_state(&mut self, job_id: JobId, state: NewState) -> &mut Self {
        self.queue_command(Command::AddJobState { job_id, state })
    }

    pub fn add_to_queue(&mut self, queue: impl Into<String>, job_id: JobId) -> &mut Self {
        self.queue_command(Command::AddToQueue {
            queue: queue.into(),
            job_id,
        })
    }

    pub fn increment_counter(&mut self, key: impl Into<String>) -> &mut Self {
        self.queue_command(Command::IncrementCounter {
            key: key.into(),
            expire_in: None,
        })
    }

    pub fn increment_counter_expiring(&mut self, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.queue_command(Command::IncrementCounter {
            key: key.into(),
            expire_in: Some(expire_in),
        })
    }

    pub fn decrement_counter(&mut self, key: impl Into<String>) -> &mut Self {
        self.queue_command(Command::DecrementCounter {
            key: key.into(),
            expire_in: None,
        })
    }

    pub fn decrement_counter_expiring(&mut self, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.queue_command(Command::DecrementCounter {
            key: key.into(),
            expire_in: Some(expire_in),
        })
    }

    /// Add a member with score 0.
    pub fn add_to_set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.add_to_set_with_score(key, value, 0.0)
    }

    /// Add a member, or update its score if already present.
    pub fn add_to_set_with_score(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        score: f64,
    ) -> &mut Self {
        self.queue_command(Command::AddToSet {
            key: key.into(),
            value: value.into(),
            score,
        })
    }

    pub fn add_range_to_set<I, S>(&mut self, key: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_command(Command::AddRangeToSet {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn remove_from_set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.queue_command(Command::RemoveFromSet {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_set(&mut self, key: impl Into<String>) -> &mut Self {
        self.queue_command(Command::RemoveSet { key: key.into() })
    }

    pub fn insert_to_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.queue_command(Command::InsertToList {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Remove every entry under `key` equal to `value`.
    pub fn remove_from_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.queue_command(Command::RemoveFromList {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Keep newest-first positions `keep_from..=keep_to` of the list and drop the rest.
    pub fn trim_list(&mut self, key: impl Into<String>, keep_from: i64, keep_to: i64) -> &mut Self {
        self.queue_command(Command::TrimList {
            key: key.into(),
            keep_from,
            keep_to,
        })
    }

    pub fn set_range_in_hash<I, K, V>(&mut self, key: impl Into<String>, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.queue_command(Command::SetRangeInHash {
            key: key.into(),
            entries: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        })
    }

    pub fn remove_hash(&mut self, key: impl Into<String>) -> &mut Self {
        self.queue_command(Command::RemoveHash { key: key.into() })
    }

    pub fn expire(&mut self, kind: AggregateKind, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        let key = key.into();
        self.queue_command(match kind {
            AggregateKind::Set => Command::ExpireSet { key, expire_in },
            AggregateKind::List => Command::ExpireList { key, expire_in },
            AggregateKind::Hash => Command::ExpireHash { key, expire_in },
        })
    }

    pub fn persist(&mut self, kind: AggregateKind, key: impl Into<String>) -> &mut Self {
        let key = key.into();
        self.queue_command(match kind {
            AggregateKind::Set => Command::PersistSet { key },
            AggregateKind::List => Command::PersistList { key },
            AggregateKind::Hash => Command::PersistHash { key },
        })
    }

    /// Apply every queued command in order.
    ///
    /// Stops at the first failure and reports its position as
    /// [`StoreError::CommitFailed`].
    pub async fn commit(self) -> Result<(), StoreError> {
        let total = self.commands.len();
        tracing::debug!("Committing transaction with {} commands", total);

        for (index, command) in self.commands.iter().enumerate() {
            if let Err(e) = self.apply(command).await {
                tracing::warn!(
                    "Transaction command {} ({}) of {} failed: {}",
                    index,
                    command.name(),
                    total,
                    e
                );
                return Err(StoreError::CommitFailed {
                    index,
                    source: Box::new(e),
                });
            }
        }

        Ok(())
    }

    async fn apply(&self, command: &Command) -> Result<(), StoreError> {
        let c = self.ctx.collections();

        match command {
            Command::ExpireJob { job_id, expire_in } => {
                let expire_at = self.expire_at(*expire_in).await?;
                self.run(
                    format!("UPDATE type::thing('{}', $id) SET expire_at = <datetime> $expire_at;", c.job),
                    |q| q.bind(("id", job_id.to_string())).bind(("expire_at", expire_at)),
                )
                .await
            }
            Command::PersistJob { job_id } => {
                self.run(
                    format!("UPDATE type::thing('{}', $id) SET expire_at = NONE;", c.job),
                    |q| q.bind(("id", job_id.to_string())),
                )
                .await
            }
            Command::SetJobState { job_id, state } => self.insert_state(*job_id, state, true).await,
            Command::AddJobState { job_id, state } => self.insert_state(*job_id, state, false).await,
            Command::AddToQueue { queue, job_id } => {
                self.providers
                    .provider_for(queue)
                    .job_queue(&self.ctx)
                    .enqueue(queue, *job_id)
                    .await
            }
            Command::IncrementCounter { key, expire_in } => self.insert_counter(key, 1, *expire_in).await,
            Command::DecrementCounter { key, expire_in } => self.insert_counter(key, -1, *expire_in).await,
            Command::AddToSet { key, value, score } => self.upsert_set_member(key, value, *score).await,
            Command::AddRangeToSet { key, values } => {
                for value in values {
                    self.upsert_set_member(key, value, 0.0).await?;
                }
                Ok(())
            }
            Command::RemoveFromSet { key, value } => {
                self.run(format!("DELETE type::thing('{}', [$key, $value]);", c.set), |q| {
                    q.bind(("key", key.clone())).bind(("value", value.clone()))
                })
                .await
            }
            Command::RemoveSet { key } => self.delete_by_key(&c.set, key).await,
            Command::InsertToList { key, value } => {
                self.run(
                    format!("CREATE type::thing('{}', $id) SET key = $key, value = $value;", c.list),
                    |q| {
                        q.bind(("id", next_ulid().to_string()))
                            .bind(("key", key.clone()))
                            .bind(("value", value.clone()))
                    },
                )
                .await
            }
            Command::RemoveFromList { key, value } => {
                self.run(format!("DELETE {} WHERE key = $key AND value = $value;", c.list), |q| {
                    q.bind(("key", key.clone())).bind(("value", value.clone()))
                })
                .await
            }
            Command::TrimList {
                key,
                keep_from,
                keep_to,
            } => self.trim_list_entries(key, *keep_from, *keep_to).await,
            Command::SetRangeInHash { key, entries } => {
                for (field, value) in entries {
                    self.run(
                        format!(
                            "UPSERT type::thing('{}', [$key, $field]) SET key = $key, field = $field, value = $value;",
                            c.hash
                        ),
                        |q| {
                            q.bind(("key", key.clone()))
                                .bind(("field", field.clone()))
                                .bind(("value", value.clone()))
                        },
                    )
                    .await?;
                }
                Ok(())
            }
            Command::RemoveHash { key } => self.delete_by_key(&c.hash, key).await,
            Command::ExpireSet { key, expire_in } => self.expire_key(&c.set, key, *expire_in).await,
            Command::ExpireList { key, expire_in } => self.expire_key(&c.list, key, *expire_in).await,
            Command::ExpireHash { key, expire_in } => self.expire_key(&c.hash, key, *expire_in).await,
            Command::PersistSet { key } => self.persist_key(&c.set, key).await,
            Command::PersistList { key } => self.persist_key(&c.list, key).await,
            Command::PersistHash { key } => self.persist_key(&c.hash, key).await,
        }
    }

    /// Run one statement (or script) and surface any statement error.
    async fn run<F>(&self, sql: String, bind: F) -> Result<(), StoreError>
    where
        F: FnOnce(
            surrealdb::method::Query<'_, surrealdb::engine::any::Any>,
        ) -> surrealdb::method::Query<'_, surrealdb::engine::any::Any>,
    {
        bind(self.ctx.db().query(sql)).await?.check()?;
        Ok(())
    }

    async fn expire_at(&self, expire_in: Duration) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.ctx.clock().now().await? + chrono_duration(expire_in))
    }

    async fn insert_state(&self, job_id: JobId, state: &NewState, make_current: bool) -> Result<(), StoreError> {
        let c = self.ctx.collections();
        let created_at = self.ctx.clock().now().await?;
        let state_id = next_ulid().to_string();

        let create = format!(
            "CREATE type::thing('{}', $state_id) SET job_id = $job_id, name = $name, reason = $reason, \
             created_at = <datetime> $created_at, data = $data;",
            c.state
        );
        let sql = if make_current {
            format!(
                "BEGIN TRANSACTION;\n{}\nUPDATE type::thing('{}', $job_id) SET state_id = $state_id, state_name = $name;\nCOMMIT TRANSACTION;",
                create, c.job
            )
        } else {
            create
        };

        self.run(sql, |q| {
            q.bind(("state_id", state_id))
                .bind(("job_id", job_id.to_string()))
                .bind(("name", state.name.clone()))
                .bind(("reason", state.reason.clone()))
                .bind(("created_at", created_at))
                .bind(("data", state.data.clone()))
        })
        .await
    }

    async fn insert_counter(&self, key: &str, value: i64, expire_in: Option<Duration>) -> Result<(), StoreError> {
        let table = &self.ctx.collections().counter;
        match expire_in {
            Some(expire_in) => {
                let expire_at = self.expire_at(expire_in).await?;
                self.run(
                    format!(
                        "CREATE {} SET key = $key, value = $value, expire_at = <datetime> $expire_at;",
                        table
                    ),
                    |q| {
                        q.bind(("key", key.to_string()))
                            .bind(("value", value))
                            .bind(("expire_at", expire_at))
                    },
                )
                .await
            }
            None => {
                self.run(format!("CREATE {} SET key = $key, value = $value;", table), |q| {
                    q.bind(("key", key.to_string())).bind(("value", value))
                })
                .await
            }
        }
    }

    async fn upsert_set_member(&self, key: &str, value: &str, score: f64) -> Result<(), StoreError> {
        self.run(
            format!(
                "UPSERT type::thing('{}', [$key, $value]) SET key = $key, value = $value, score = $score;",
                self.ctx.collections().set
            ),
            |q| {
                q.bind(("key", key.to_string()))
                    .bind(("value", value.to_string()))
                    .bind(("score", score))
            },
        )
        .await
    }

    async fn trim_list_entries(&self, key: &str, keep_from: i64, keep_to: i64) -> Result<(), StoreError> {
        let table = &self.ctx.collections().list;
        let start = keep_from.max(0);

        if keep_from > keep_to || keep_to < start {
            return self.delete_by_key(table, key).await;
        }

        self.run(
            format!(
                "LET $keep = (SELECT id FROM {0} WHERE key = $key ORDER BY id DESC LIMIT $count START $start);\n\
                 DELETE {0} WHERE key = $key AND id NOTINSIDE $keep.id;",
                table
            ),
            |q| {
                q.bind(("key", key.to_string()))
                    .bind(("count", keep_to.saturating_sub(start).saturating_add(1)))
                    .bind(("start", start))
            },
        )
        .await
    }

    async fn delete_by_key(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.run(format!("DELETE {} WHERE key = $key;", table), |q| {
            q.bind(("key", key.to_string()))
        })
        .await
    }

    async fn expire_key(&self, table: &str, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        let expire_at = self.expire_at(expire_in).await?;
        self.run(
            format!("UPDATE {} SET expire_at = <datetime> $expire_at WHERE key = $key;", table),
            |q| q.bind(("key", key.to_string())).bind(("expire_at", expire_at)),
        )
        .await
    }

    async fn persist_key(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.run(format!("UPDATE {} SET expire_at = NONE WHERE key = $key;", table), |q| {
            q.bind(("key", key.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use surrealdb::Surreal;

    use crate::connection::StorageOptions;
    use crate::queue::SurrealQueueProvider;

    fn transaction() -> WriteOnlyTransaction {
        let ctx = StoreContext::new(Surreal::init(), StorageOptions::memory()).expect("valid options");
        WriteOnlyTransaction::new(ctx, QueueProviders::new(Arc::new(SurrealQueueProvider)))
    }

    #[test]
    fn commands_queue_in_call_order() {
        let job = JobId::new();
        let mut tx = transaction();
        tx.set_job_state(job, NewState::new("Enqueued"))
            .add_to_queue("default", job)
            .increment_counter_expiring("stats:succeeded", Duration::from_secs(60))
            .trim_list("recent", 0, 9);

        let names: Vec<&str> = tx.commands().iter().map(Command::name).collect();
        assert_eq!(names, ["SetJobState", "AddToQueue", "IncrementCounter", "TrimList"]);
        assert_eq!(
            tx.commands()[2],
            Command::IncrementCounter {
                key: "stats:succeeded".into(),
                expire_in: Some(Duration::from_secs(60)),
            }
        );
    }

    #[test]
    fn nothing_is_queued_until_asked() {
        let tx = transaction();
        assert!(tx.is_empty());
        assert_eq!(tx.len(), 0);
    }

    #[test]
    fn aggregate_kinds_map_to_their_commands() {
        let mut tx = transaction();
        tx.expire(AggregateKind::Set, "s", Duration::from_secs(1))
            .expire(AggregateKind::List, "l", Duration::from_secs(1))
            .persist(AggregateKind::Hash, "h");

        let names: Vec<&str> = tx.commands().iter().map(Command::name).collect();
        assert_eq!(names, ["ExpireSet", "ExpireList", "PersistHash"]);
    }

    #[test]
    fn add_to_set_defaults_score_to_zero() {
        let mut tx = transaction();
        tx.add_to_set("recurring-jobs", "nightly");
        assert_eq!(
            tx.commands()[0],
            Command::AddToSet {
                key: "recurring-jobs".into(),
                value: "nightly".into(),
                score: 0.0,
            }
        );
    }
}
