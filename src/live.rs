//! Live queries.
//!
//! Each subscription is driven by its own task, so re-evaluations of one
//! subscription are totally ordered while different subscriptions run
//! concurrently. A subscription moves through
//! `Created -> Active -> (Reevaluating -> Active)* -> Cancelled`:
//! it evaluates once on creation, then waits for its invalidation signal,
//! re-runs the query and emits only when the result differs from the last
//! value it emitted.

use futures::Stream;
use rusqlite::Connection;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::invalidation::{InvalidationSignal, SubscriptionId};
use crate::sqlite::{SqlQuery, SqliteDatabase};

/// Executes a query on a read connection and maps the rows to `T`.
pub type Fetcher<T> = fn(&Connection, &SqlQuery) -> Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Created,
    Active,
    Reevaluating,
    Cancelled,
}

/// Owns live query subscriptions over one database.
#[derive(Clone)]
pub struct LiveQueryEngine {
    db: SqliteDatabase,
    next_id: Arc<AtomicU64>,
}

impl LiveQueryEngine {
    pub fn new(db: SqliteDatabase) -> Self {
        Self {
            db,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a live query and schedule its first evaluation.
    ///
    /// Fails with [`StoreError::NoRuntime`] outside a Tokio runtime. The
    /// returned stream yields `Ok` for every distinct result and `Err` for
    /// failed re-evaluations; a failure leaves the subscription active.
    pub fn observe<T>(&self, query: SqlQuery, fetch: Fetcher<T>) -> Result<LiveQuery<T>>
    where
        T: Clone + PartialEq + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let signal = Arc::new(InvalidationSignal::new());
        let token = CancellationToken::new();
        let evaluations = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(self.db.config().channel_capacity.max(1));

        // Register before the first evaluation so no commit is missed.
        self.db
            .tracker()
            .subscribe(&query.tables, id, Arc::downgrade(&signal));

        let subscription = Subscription {
            id,
            query: Arc::new(query),
            fetch,
            last: None,
            state: SubscriptionState::Created,
            signal,
            token: token.clone(),
            tx,
            evaluations: Arc::clone(&evaluations),
            db: self.db.clone(),
        };
        runtime.spawn(subscription.run());

        Ok(LiveQuery {
            id,
            rx,
            token,
            evaluations,
        })
    }
}

struct Subscription<T> {
    id: SubscriptionId,
    query: Arc<SqlQuery>,
    fetch: Fetcher<T>,
    last: Option<T>,
    state: SubscriptionState,
    signal: Arc<InvalidationSignal>,
    token: CancellationToken,
    tx: mpsc::Sender<Result<T>>,
    evaluations: Arc<AtomicU64>,
    db: SqliteDatabase,
}

impl<T> Subscription<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    async fn run(mut self) {
        debug!(subscription = %self.id, "live query created");
        while self.evaluate().await {
            self.transition(SubscriptionState::Active);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = self.signal.changed() => {}
            }
        }
        self.transition(SubscriptionState::Cancelled);
        self.db.tracker().unsubscribe(self.id);
    }

    /// Evaluate once and emit if the result changed. Returns false once the
    /// subscription should stop.
    async fn evaluate(&mut self) -> bool {
        if self.state != SubscriptionState::Created {
            self.transition(SubscriptionState::Reevaluating);
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let query = Arc::clone(&self.query);
        let signal = Arc::clone(&self.signal);
        let fetch = self.fetch;
        let read = self.db.read(move |conn| {
            // Commits after this point mark the signal dirty again.
            signal.clear();
            fetch(conn, &query)
        });
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return false,
            result = read => result,
        };

        let item = match result {
            Ok(value) if self.last.as_ref() == Some(&value) => return true,
            Ok(value) => {
                self.last = Some(value.clone());
                Ok(value)
            }
            Err(e) => {
                warn!(subscription = %self.id, error = %e, "live query evaluation failed");
                Err(e)
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    fn transition(&mut self, next: SubscriptionState) {
        if self.state != next {
            debug!(subscription = %self.id, from = ?self.state, to = ?next, "live query state");
            self.state = next;
        }
    }
}

/// Caller's handle to a live query.
///
/// Yields each distinct result as a [`Stream`]. Cancelling, or dropping the
/// handle, ends the subscription; no item is yielded after cancellation even
/// if one was already buffered.
pub struct LiveQuery<T> {
    id: SubscriptionId,
    rx: mpsc::Receiver<Result<T>>,
    token: CancellationToken,
    evaluations: Arc<AtomicU64>,
}

impl<T> LiveQuery<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop the subscription. Calling this more than once is a no-op.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that cancels this subscription from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// How many times the query has been (re-)evaluated so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

impl<T> Stream for LiveQuery<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            // Cancelled while the item was in flight: drop it.
            Poll::Ready(Some(_)) if this.token.is_cancelled() => Poll::Ready(None),
            other => other,
        }
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
