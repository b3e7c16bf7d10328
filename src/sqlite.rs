use rusqlite::types::ToSqlOutput;
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags, ToSql};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::invalidation::InvalidationTracker;

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
            Value::Blob(v) => ToSqlOutput::from(v.as_slice()),
            Value::Boolean(v) => ToSqlOutput::from(*v),
        })
    }
}

/// Positional parameter bindings for SQL statements (`?1`, `?2`, ...)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Params {
    pub values: Vec<Value>,
}

impl Params {
    /// Create a new Params object
    pub fn new() -> Self {
        Self::default()
    }
    /// Append the next positional value
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

/// SQL statement with typed parameters and the tables it reads from.
///
/// `tables` is the dependency set used for invalidation. It is supplied by
/// the issuer; statements are never parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Params,
    pub tables: Vec<String>,
}

impl SqlQuery {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            params: Params::new(),
            tables: Vec::new(),
        }
    }
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.values.push(value.into());
        self
    }
    /// Declare a table this statement reads from.
    pub fn reads(mut self, table: &str) -> Self {
        if !self.tables.iter().any(|t| t == table) {
            self.tables.push(table.to_string());
        }
        self
    }

    /// Execute a mutating statement, returning the number of affected rows.
    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare_cached(&self.statement)?;
        Ok(stmt.execute(params_from_iter(self.params.iter()))?)
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,
    /// Bound of the blocking worker pool, also the number of read connections
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
    /// Emissions buffered per live query before the driver waits on the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_worker_threads() -> usize {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_wal_mode() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    16
}

impl SqliteConfig {
    /// Create a new SQLite config for the given database file
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            worker_threads: default_worker_threads(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wal_mode: default_wal_mode(),
            channel_capacity: default_channel_capacity(),
        }
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        createdAt INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(createdAt);
";

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

struct Inner {
    config: SqliteConfig,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    workers: Arc<Semaphore>,
    tracker: Arc<InvalidationTracker>,
}

/// Shared handle to an on-disk SQLite database.
///
/// Cloning is cheap; every clone shares the same writer connection, read
/// pool, worker pool and invalidation tracker. Blocking SQLite calls run on
/// Tokio's blocking threads, at most `worker_threads` at a time.
#[derive(Clone)]
pub struct SqliteDatabase {
    inner: Arc<Inner>,
}

impl SqliteDatabase {
    /// Open (creating if needed) the database described by `config`.
    pub fn open(config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let writer = Connection::open_with_flags(
            &config.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        writer.busy_timeout(busy_timeout)?;
        if config.wal_mode {
            let mode: String =
                writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(journal_mode = %mode, "configured journal mode");
        }
        initialize_schema(&writer)?;

        let worker_threads = config.worker_threads.max(1);
        let readers = (0..worker_threads)
            .map(|_| -> Result<Mutex<Connection>> {
                let conn = Connection::open_with_flags(
                    &config.db_path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(busy_timeout)?;
                Ok(Mutex::new(conn))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            path = %config.db_path.display(),
            workers = worker_threads,
            "opened sqlite database"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                readers,
                workers: Arc::new(Semaphore::new(worker_threads)),
                tracker: Arc::new(InvalidationTracker::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &Arc<InvalidationTracker> {
        &self.inner.tracker
    }

    /// Stop accepting new work. In-flight operations finish normally.
    pub fn close(&self) {
        self.inner.workers.close();
        info!(path = %self.inner.config.db_path.display(), "closed sqlite database");
    }

    /// Run `f` against the writer connection on the worker pool.
    ///
    /// Only the transactional executor calls this.
    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &InvalidationTracker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.run_blocking(move || {
            let mut conn = inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn, &inner.tracker)
        })
        .await
    }

    /// Run `f` against a read-only connection on the worker pool.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.run_blocking(move || {
            let conn = acquire_reader(&inner.readers)?;
            f(&conn)
        })
        .await
    }

    /// Run `f` against a read-only connection, aborting when `cancel` fires.
    ///
    /// A cancelled read interrupts the in-flight statement and resolves to
    /// [`StoreError::Cancelled`]; partial results are never returned.
    pub async fn read_cancellable<T, F>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let in_flight: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&in_flight);
        let token = cancel.clone();
        let work = self.read(move |conn| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.get_interrupt_handle());
            // Cancelled before the handle was visible to the canceller.
            if token.is_cancelled() {
                slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                return Err(StoreError::Cancelled);
            }
            let result = f(conn, &token);
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            result
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Interrupt under the lock so it cannot reach a later statement.
                if let Some(handle) = in_flight.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    handle.interrupt();
                }
                debug!("cancelled in-flight read");
                Err(StoreError::Cancelled)
            }
            result = work => match result {
                Err(e) if cancel.is_cancelled() || e.is_interrupt() => Err(StoreError::Cancelled),
                other => other,
            },
        }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await?
    }
}

fn acquire_reader(readers: &[Mutex<Connection>]) -> Result<MutexGuard<'_, Connection>> {
    for slot in readers {
        match slot.try_lock() {
            Ok(conn) => return Ok(conn),
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => continue,
        }
    }
    // Every reader busy: wait on the first one.
    let first = readers.first().ok_or(StoreError::Closed)?;
    Ok(first.lock().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_reads_deduplicates_tables() {
        let query = SqlQuery::new("SELECT 1").reads("tasks").reads("tasks").reads("notes");
        assert_eq!(query.tables, vec!["tasks".to_string(), "notes".to_string()]);
    }

    #[test]
    fn optional_values_bind_as_null() {
        let params = Params::new().with_value(None::<i64>).with_value(Some("x"));
        assert_eq!(params.values, vec![Value::Null, Value::Text("x".into())]);
    }

    #[test]
    fn values_bind_positionally() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let query = SqlQuery::new("SELECT ?1 + ?2, ?3")
            .bind(40i64)
            .bind(2i64)
            .bind(true);
        let (sum, flag): (i64, bool) = conn.query_row(
            &query.statement,
            params_from_iter(query.params.iter()),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(sum, 42);
        assert!(flag);
        Ok(())
    }

    #[test]
    fn config_defaults_apply_when_deserializing() {
        let config: SqliteConfig = serde::de::Deserialize::deserialize(
            serde::de::value::MapDeserializer::<_, serde::de::value::Error>::new(
                [("db_path", "tasks.db")].into_iter(),
            ),
        )
        .unwrap();
        assert_eq!(config, SqliteConfig::new("tasks.db"));
    }
}
