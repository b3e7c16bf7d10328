use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::live::{LiveQuery, LiveQueryEngine};
use crate::row::{fetch_all, fetch_all_cancellable, fetch_count};
use crate::sqlite::SqliteDatabase;
use crate::task::{queries, Task, TaskColumns, TASKS_TABLE};
use crate::transaction::TransactionExecutor;

/// Data access operations over tasks.
#[async_trait]
pub trait TaskDao: Send + Sync {
    /// Insert `task`, replacing any row with the same id. An id of 0 lets the
    /// store assign one; the row id actually written is returned.
    async fn insert(&self, task: &Task) -> Result<i64>;

    /// Overwrite the row matching `task.id`. Returns the number of rows
    /// updated; a missing id updates nothing and is not an error.
    async fn update(&self, task: &Task) -> Result<usize>;

    /// Delete the row matching `task.id`. Returns the number of rows removed.
    async fn delete(&self, task: &Task) -> Result<usize>;

    /// All tasks, newest first, re-emitted whenever the list changes.
    fn observe_all(&self) -> Result<LiveQuery<Vec<Task>>>;

    /// One page of tasks, newest first.
    async fn fetch_page(
        &self,
        limit: u32,
        offset: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>>;

    /// Number of tasks created at or after `timestamp`.
    fn observe_count_since(&self, timestamp: i64) -> Result<LiveQuery<i64>>;

    fn observe_completed_count(&self) -> Result<LiveQuery<i64>>;
}

/// [`TaskDao`] backed by a [`SqliteDatabase`].
#[derive(Clone)]
pub struct SqliteTaskDao {
    db: SqliteDatabase,
    executor: TransactionExecutor,
    live: LiveQueryEngine,
}

impl SqliteTaskDao {
    pub fn new(db: SqliteDatabase) -> Self {
        Self {
            executor: TransactionExecutor::new(db.clone()),
            live: LiveQueryEngine::new(db.clone()),
            db,
        }
    }

    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }

    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    pub fn live(&self) -> &LiveQueryEngine {
        &self.live
    }
}

#[async_trait]
impl TaskDao for SqliteTaskDao {
    async fn insert(&self, task: &Task) -> Result<i64> {
        let query = queries::upsert(task);
        self.executor
            .run_in_transaction(&[TASKS_TABLE], move |tx| {
                query.execute(tx)?;
                Ok(tx.last_insert_rowid())
            })
            .await
    }

    async fn update(&self, task: &Task) -> Result<usize> {
        let query = queries::update(task);
        self.executor
            .run_in_transaction(&[TASKS_TABLE], move |tx| query.execute(tx))
            .await
    }

    async fn delete(&self, task: &Task) -> Result<usize> {
        let query = queries::delete(task);
        self.executor
            .run_in_transaction(&[TASKS_TABLE], move |tx| query.execute(tx))
            .await
    }

    fn observe_all(&self) -> Result<LiveQuery<Vec<Task>>> {
        self.live.observe(queries::all(), fetch_all::<TaskColumns>)
    }

    async fn fetch_page(
        &self,
        limit: u32,
        offset: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>> {
        let query = queries::page(limit, offset);
        self.db
            .read_cancellable(cancel, move |conn, token| {
                fetch_all_cancellable::<TaskColumns>(conn, &query, token)
            })
            .await
    }

    fn observe_count_since(&self, timestamp: i64) -> Result<LiveQuery<i64>> {
        self.live.observe(queries::count_since(timestamp), fetch_count)
    }

    fn observe_completed_count(&self) -> Result<LiveQuery<i64>> {
        self.live.observe(queries::completed_count(), fetch_count)
    }
}
