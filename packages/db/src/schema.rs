//! Table layout, indexes and the schema-version gate.

use serde::Deserialize;

use crate::connection::{StoreContext, StoreError};

/// Schema version this code reads and writes.
pub const REQUIRED_SCHEMA_VERSION: i64 = 7;

/// Names of the tables backing each record type.
///
/// Every name is `"{prefix}_{suffix}"`, so several stores can share one
/// SurrealDB database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub locks: String,
    pub counter: String,
    pub aggregated_counter: String,
    pub hash: String,
    pub job: String,
    pub list: String,
    pub schema: String,
    pub server: String,
    pub set: String,
    pub state: String,
}

impl Collections {
    pub fn new(prefix: &str) -> Result<Self, StoreError> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidArgument(format!("invalid table prefix: {:?}", prefix)));
        }
        let name = |suffix: &str| format!("{}_{}", prefix, suffix);
        Ok(Self {
            locks: name("locks"),
            counter: name("counter"),
            aggregated_counter: name("aggregate"),
            hash: name("hash"),
            job: name("job"),
            list: name("list"),
            schema: name("schema"),
            server: name("server"),
            set: name("set"),
            state: name("state"),
        })
    }

    /// All tables, in definition order.
    pub fn all(&self) -> [&str; 10] {
        [
            &self.locks,
            &self.counter,
            &self.aggregated_counter,
            &self.hash,
            &self.job,
            &self.list,
            &self.schema,
            &self.server,
            &self.set,
            &self.state,
        ]
    }

    /// Tables whose rows carry an optional `expire_at`.
    pub fn expirable(&self) -> [&str; 6] {
        [
            &self.job,
            &self.counter,
            &self.aggregated_counter,
            &self.list,
            &self.set,
            &self.hash,
        ]
    }
}

#[derive(Debug, Deserialize)]
struct SchemaRow {
    version: i64,
}

/// Initialize tables, check the schema version and create indexes.
///
/// Safe to call on every startup. Fails with [`StoreError::SchemaIncompatible`]
/// when the stored version is newer than [`REQUIRED_SCHEMA_VERSION`]; in that
/// case no index is touched.
pub async fn init_schema(ctx: &StoreContext) -> Result<(), StoreError> {
    let db = ctx.db();
    let c = ctx.collections();

    tracing::info!("Initializing job store schema (prefix tables {}...)", c.job);

    let tables: String = c
        .all()
        .iter()
        .map(|table| format!("DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;", table))
        .collect::<Vec<_>>()
        .join("\n");
    db.query(tables).await?.check()?;

    check_schema_version(ctx).await?;

    db.query(index_definitions(c)).await?.check()?;

    tracing::info!("Job store schema initialized (version {})", REQUIRED_SCHEMA_VERSION);

    Ok(())
}

/// Read the stored schema version, if one was ever written.
pub async fn stored_schema_version(ctx: &StoreContext) -> Result<Option<i64>, StoreError> {
    let mut response = ctx
        .db()
        .query(format!("SELECT version FROM type::thing('{}', 'version');", ctx.collections().schema))
        .await?;
    let rows: Vec<SchemaRow> = response.take(0)?;
    Ok(rows.into_iter().next().map(|row| row.version))
}

/// Overwrite the stored schema version marker.
pub async fn write_schema_version(ctx: &StoreContext, version: i64) -> Result<(), StoreError> {
    ctx.db()
        .query(format!(
            "UPSERT type::thing('{}', 'version') SET version = $version;",
            ctx.collections().schema
        ))
        .bind(("version", version))
        .await?
        .check()?;
    Ok(())
}

async fn check_schema_version(ctx: &StoreContext) -> Result<(), StoreError> {
    match stored_schema_version(ctx).await? {
        None => {
            tracing::info!("No schema marker found, writing version {}", REQUIRED_SCHEMA_VERSION);
            write_schema_version(ctx, REQUIRED_SCHEMA_VERSION).await
        }
        Some(stored) if stored < REQUIRED_SCHEMA_VERSION => {
            tracing::info!(
                "Upgrading schema marker from version {} to {}",
                stored,
                REQUIRED_SCHEMA_VERSION
            );
            write_schema_version(ctx, REQUIRED_SCHEMA_VERSION).await
        }
        Some(stored) if stored > REQUIRED_SCHEMA_VERSION => Err(StoreError::SchemaIncompatible {
            stored,
            required: REQUIRED_SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
    }
}

fn index_definitions(c: &Collections) -> String {
    let mut statements = vec![
        // Compound index for queue polling (claimable jobs per queue)
        format!(
            "DEFINE INDEX IF NOT EXISTS {0}_queue_fetched ON {0} FIELDS queue, fetched_at;",
            c.job
        ),
        // State history lookup by job
        format!("DEFINE INDEX IF NOT EXISTS {0}_job_id ON {0} FIELDS job_id;", c.state),
    ];

    for table in [&c.counter, &c.aggregated_counter, &c.set, &c.hash, &c.list] {
        statements.push(format!("DEFINE INDEX IF NOT EXISTS {0}_key ON {0} FIELDS key;", table));
    }

    // Expiry indexes drive the expiration sweep
    for table in c.expirable() {
        statements.push(format!(
            "DEFINE INDEX IF NOT EXISTS {0}_expire_at ON {0} FIELDS expire_at;",
            table
        ));
    }

    statements.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed() {
        let c = Collections::new("jobs").expect("valid prefix");
        assert_eq!(c.job, "jobs_job");
        assert_eq!(c.aggregated_counter, "jobs_aggregate");
        assert!(c.all().iter().all(|t| t.starts_with("jobs_")));
    }

    #[test]
    fn rejects_unsafe_prefix() {
        assert!(Collections::new("").is_err());
        assert!(Collections::new("a;DELETE").is_err());
    }

    #[test]
    fn indexes_cover_queue_predicate_and_expiry() {
        let c = Collections::new("hangfire").expect("valid prefix");
        let ddl = index_definitions(&c);
        assert!(ddl.contains("ON hangfire_job FIELDS queue, fetched_at"));
        assert!(ddl.contains("ON hangfire_state FIELDS job_id"));
        for table in c.expirable() {
            assert!(ddl.contains(&format!("ON {} FIELDS expire_at", table)));
        }
    }
}
