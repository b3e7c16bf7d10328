//! Reactive SQLite task store for the Runar ecosystem.
//!
//! # Intention
//!
//! - Persist tasks in an on-device SQLite database with atomic writes.
//! - Serve one-shot reads and live queries that re-emit whenever a table
//!   they read from is committed to, suppressing unchanged results.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database code belongs here.
//! - Opening and closing the database is the caller's job; every component
//!   receives the [`SqliteDatabase`] handle explicitly.
//! - Invalidation is per table. Rows and columns are not tracked.

pub mod dao;
pub mod error;
pub mod invalidation;
pub mod live;
pub mod pager;
pub mod row;
pub mod sqlite;
pub mod task;
pub mod transaction;

pub use dao::{SqliteTaskDao, TaskDao};
pub use error::{Result, StoreError};
pub use invalidation::{InvalidationSignal, InvalidationTracker, SubscriptionId};
pub use live::{Fetcher, LiveQuery, LiveQueryEngine};
pub use pager::TaskPager;
pub use sqlite::{Params, SqlQuery, SqliteConfig, SqliteDatabase, Value};
pub use task::{start_of_day, Task, TASKS_TABLE};
pub use transaction::TransactionExecutor;
