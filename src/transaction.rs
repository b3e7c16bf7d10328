use rusqlite::{Transaction, TransactionBehavior};
use tracing::debug;

use crate::error::Result;
use crate::sqlite::SqliteDatabase;

/// Runs mutating work atomically on the writer connection.
///
/// This is the only way to open a transaction. Committed changes are
/// announced to the invalidation tracker after the commit returns; failed or
/// aborted work is rolled back and announces nothing.
#[derive(Clone)]
pub struct TransactionExecutor {
    db: SqliteDatabase,
}

impl TransactionExecutor {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    /// Run `work` inside a transaction that declares `tables` as changed.
    ///
    /// Any error returned by `work` (including [`StoreError::Aborted`]) rolls
    /// the transaction back and is returned as-is. The notification is sent
    /// from the worker, so dropping this future after the commit cannot lose it.
    ///
    /// [`StoreError::Aborted`]: crate::error::StoreError::Aborted
    pub async fn run_in_transaction<T, F>(&self, tables: &[&str], work: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        self.db
            .write(move |conn, tracker| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                // Dropping `tx` on the error path rolls back.
                let out = work(&tx)?;
                tx.commit()?;
                debug!(?tables, "transaction committed");
                for table in &tables {
                    tracker.notify_changed(table);
                }
                Ok(out)
            })
            .await
    }
}
