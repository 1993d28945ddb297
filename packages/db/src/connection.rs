//! Store configuration, connection management and the shared store context.

use std::sync::Arc;
use std::time::Duration;

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

use crate::clock::ServerClock;
use crate::schema::Collections;

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Connection target: "mem://", "rocksdb://path", "ws://host:port", ...
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Prefix applied to every table name.
    pub prefix: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
    /// How long an empty dequeue waits before polling again.
    pub queue_poll_interval: Duration,
    /// Age after which an unreleased lease counts as abandoned.
    pub invisibility_timeout: Duration,
    /// Period of the explicit expiration sweep.
    pub job_expiration_check_interval: Duration,
    /// Period of counter aggregation.
    pub counters_aggregate_interval: Duration,
    /// Lifetime of a distributed lock record before others may break it.
    pub distributed_lock_lifetime: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobstore".to_string(),
            database: "main".to_string(),
            prefix: "hangfire".to_string(),
            credentials: None,
            queue_poll_interval: Duration::from_secs(15),
            invisibility_timeout: Duration::from_secs(30 * 60),
            job_expiration_check_interval: Duration::from_secs(60 * 60),
            counters_aggregate_interval: Duration::from_secs(5 * 60),
            distributed_lock_lifetime: Duration::from_secs(30),
        }
    }
}

impl StorageOptions {
    /// Create options for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create options for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the table-name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the empty-queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    /// Set the lease invisibility timeout.
    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    /// Build options from environment variables.
    ///
    /// - `JOBSTORE_ENDPOINT` (default: `mem://`)
    /// - `JOBSTORE_NAMESPACE`, `JOBSTORE_DATABASE`
    /// - `JOBSTORE_PREFIX` (default: `hangfire`)
    /// - `JOBSTORE_USER` + `JOBSTORE_PASS` (optional root credentials)
    /// - `JOBSTORE_POLL_INTERVAL_MS`
    /// - `JOBSTORE_INVISIBILITY_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build options from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let mut options = Self::default();

        if let Some(endpoint) = lookup("JOBSTORE_ENDPOINT") {
            options.endpoint = endpoint;
        }
        if let Some(namespace) = lookup("JOBSTORE_NAMESPACE") {
            options.namespace = namespace;
        }
        if let Some(database) = lookup("JOBSTORE_DATABASE") {
            options.database = database;
        }
        if let Some(prefix) = lookup("JOBSTORE_PREFIX") {
            options.prefix = prefix;
        }
        if let (Some(user), Some(pass)) = (lookup("JOBSTORE_USER"), lookup("JOBSTORE_PASS")) {
            options.credentials = Some((user, pass));
        }
        if let Some(raw) = lookup("JOBSTORE_POLL_INTERVAL_MS") {
            let millis = raw.parse::<u64>().map_err(|_| {
                StoreError::InvalidArgument(format!("JOBSTORE_POLL_INTERVAL_MS is not a number: {}", raw))
            })?;
            options.queue_poll_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup("JOBSTORE_INVISIBILITY_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|_| {
                StoreError::InvalidArgument(format!(
                    "JOBSTORE_INVISIBILITY_TIMEOUT_SECS is not a number: {}",
                    raw
                ))
            })?;
            options.invisibility_timeout = Duration::from_secs(secs);
        }

        options.validate()?;
        Ok(options)
    }

    /// Reject options the store can't work with.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.endpoint.is_empty() {
            return Err(StoreError::InvalidArgument("endpoint must not be empty".into()));
        }
        if self.namespace.is_empty() || self.database.is_empty() {
            return Err(StoreError::InvalidArgument(
                "namespace and database must not be empty".into(),
            ));
        }
        if self.prefix.is_empty() || !self.prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidArgument(format!(
                "prefix must be non-empty and contain only [A-Za-z0-9_]: {:?}",
                self.prefix
            )));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(StoreError::InvalidArgument("queue poll interval must be positive".into()));
        }
        if self.invisibility_timeout.is_zero() {
            return Err(StoreError::InvalidArgument("invisibility timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error(
        "Stored schema version {stored} is newer than the supported version {required}; upgrade before connecting"
    )]
    SchemaIncompatible { stored: i64, required: i64 },
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timed out acquiring lock: {0}")]
    LockTimeout(String),
    #[error("Transaction command {index} failed: {source}")]
    CommitFailed {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether the store rejected a write because a concurrent transaction touched the same record.
    pub(crate) fn is_write_conflict(&self) -> bool {
        match self {
            StoreError::Unavailable(e) => {
                let message = e.to_string();
                message.contains("conflict") || message.contains("can be retried")
            }
            _ => false,
        }
    }

    /// Whether a CREATE hit an existing record id.
    pub(crate) fn is_record_exists(&self) -> bool {
        match self {
            StoreError::Unavailable(e) => e.to_string().contains("already exists"),
            _ => false,
        }
    }
}

/// Open a connection and select the configured namespace and database.
pub async fn connect(options: &StorageOptions) -> Result<Database, StoreError> {
    options.validate()?;
    tracing::info!("Connecting to job store: {}", options.endpoint);

    let db = connect_any(options.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &options.credentials {
        db.signin(Root {
            username,
            password,
        })
        .await?;
    }

    db.use_ns(&options.namespace).use_db(&options.database).await?;

    tracing::info!(
        "Connected to job store: {}/{}",
        options.namespace,
        options.database
    );

    Ok(db)
}

/// Everything a store component needs: the connection, table names,
/// the server clock and the options it was built from.
///
/// Cheap to clone; all clones share one connection and one clock.
#[derive(Clone)]
pub struct StoreContext {
    db: Database,
    collections: Arc<Collections>,
    clock: ServerClock,
    options: Arc<StorageOptions>,
}

impl StoreContext {
    pub fn new(db: Database, options: StorageOptions) -> Result<Self, StoreError> {
        options.validate()?;
        let collections = Collections::new(&options.prefix)?;
        let clock = ServerClock::new(db.clone());
        Ok(Self {
            db,
            collections: Arc::new(collections),
            clock,
            options: Arc::new(options),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("collections", &self.collections)
            .field("options", &self.options)
            .finish()
    }
}

/// Convert a configured duration into a chrono offset.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
