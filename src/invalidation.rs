//! Table-level invalidation tracking.
//!
//! Maps table names to the live subscriptions that read them. A change
//! notification marks each dependent subscription's [`InvalidationSignal`]
//! dirty. Only the clean-to-dirty transition wakes the subscription, and the
//! subscription clears the flag immediately before it runs its query, so any
//! number of notifications that land before that point collapse into a single
//! re-run, and a notification that lands during a re-run schedules exactly
//! one more.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// Identifier of a live query subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Dirty flag plus wakeup for one subscription.
#[derive(Default)]
pub struct InvalidationSignal {
    dirty: AtomicBool,
    notify: Notify,
}

impl InvalidationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark dirty. Returns true if this call made it dirty (and woke the waiter).
    pub fn invalidate(&self) -> bool {
        if self.dirty.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_one();
        true
    }

    /// Clear the flag; called right before the query runs so that every
    /// notification up to here is covered by that run.
    pub fn clear(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Wait until the flag is set. A stale wakeup left over from a
    /// notification already covered by a run is swallowed.
    pub async fn changed(&self) {
        while !self.is_dirty() {
            self.notify.notified().await;
        }
    }
}

struct Registration {
    tables: Vec<String>,
    // The subscription owns the signal; a dead weak means it already went away.
    signal: Weak<InvalidationSignal>,
}

#[derive(Default)]
struct State {
    by_table: HashMap<String, HashSet<SubscriptionId>>,
    registrations: HashMap<SubscriptionId, Registration>,
}

#[derive(Default)]
pub struct InvalidationTracker {
    state: RwLock<State>,
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as depending on `tables`, replacing any earlier registration.
    pub fn subscribe(
        &self,
        tables: &[String],
        id: SubscriptionId,
        signal: Weak<InvalidationSignal>,
    ) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(id);
        for table in tables {
            state.by_table.entry(table.clone()).or_default().insert(id);
        }
        state.registrations.insert(
            id,
            Registration {
                tables: tables.to_vec(),
                signal,
            },
        );
        debug!(subscription = %id, ?tables, "subscribed");
    }

    /// Remove every registration held by `id`. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.remove(id) {
            debug!(subscription = %id, "unsubscribed");
        }
    }

    /// Mark every subscription that reads `table` dirty.
    ///
    /// Must only be called once the change is committed. Returns the number of
    /// subscriptions woken; ones already dirty are not counted.
    pub fn notify_changed(&self, table: &str) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(ids) = state.by_table.get(table) else {
            return 0;
        };
        let mut woken = 0;
        for id in ids {
            if let Some(signal) = state
                .registrations
                .get(id)
                .and_then(|r| r.signal.upgrade())
            {
                if signal.invalidate() {
                    woken += 1;
                }
            }
        }
        debug!(table, woken, "table invalidated");
        woken
    }

    /// Number of subscriptions currently registered against `table`.
    pub fn subscription_count(&self, table: &str) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_table.get(table).map_or(0, HashSet::len)
    }
}

impl State {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(registration) = self.registrations.remove(&id) else {
            return false;
        };
        for table in &registration.tables {
            if let Some(ids) = self.by_table.get_mut(table) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_table.remove(table);
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn notifies_only_dependent_subscriptions() {
        let tracker = InvalidationTracker::new();
        let tasks = Arc::new(InvalidationSignal::new());
        let notes = Arc::new(InvalidationSignal::new());
        tracker.subscribe(&tables(&["tasks"]), SubscriptionId(1), Arc::downgrade(&tasks));
        tracker.subscribe(&tables(&["notes"]), SubscriptionId(2), Arc::downgrade(&notes));

        assert_eq!(tracker.notify_changed("tasks"), 1);
        assert_eq!(tracker.notify_changed("users"), 0);
    }

    #[test]
    fn unsubscribe_clears_every_table() {
        let tracker = InvalidationTracker::new();
        let signal = Arc::new(InvalidationSignal::new());
        tracker.subscribe(
            &tables(&["tasks", "notes"]),
            SubscriptionId(7),
            Arc::downgrade(&signal),
        );
        assert_eq!(tracker.subscription_count("notes"), 1);

        tracker.unsubscribe(SubscriptionId(7));
        tracker.unsubscribe(SubscriptionId(7));

        assert_eq!(tracker.subscription_count("tasks"), 0);
        assert_eq!(tracker.subscription_count("notes"), 0);
        assert_eq!(tracker.notify_changed("tasks"), 0);
    }

    #[test]
    fn dropped_signal_is_skipped() {
        let tracker = InvalidationTracker::new();
        let signal = Arc::new(InvalidationSignal::new());
        tracker.subscribe(&tables(&["tasks"]), SubscriptionId(3), Arc::downgrade(&signal));
        drop(signal);
        assert_eq!(tracker.notify_changed("tasks"), 0);
    }

    #[test]
    fn burst_only_wakes_on_first_notification() {
        let tracker = InvalidationTracker::new();
        let signal = Arc::new(InvalidationSignal::new());
        tracker.subscribe(&tables(&["tasks"]), SubscriptionId(1), Arc::downgrade(&signal));

        assert_eq!(tracker.notify_changed("tasks"), 1);
        for _ in 0..4 {
            assert_eq!(tracker.notify_changed("tasks"), 0);
        }
        assert!(signal.is_dirty());

        signal.clear();
        assert_eq!(tracker.notify_changed("tasks"), 1);
    }

    #[tokio::test]
    async fn parked_waiter_sees_one_change_per_burst() {
        let tracker = Arc::new(InvalidationTracker::new());
        let signal = Arc::new(InvalidationSignal::new());
        tracker.subscribe(&tables(&["tasks"]), SubscriptionId(1), Arc::downgrade(&signal));

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                signal.changed().await;
                signal.clear();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..5 {
            tracker.notify_changed("tasks");
        }
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");

        assert!(
            tokio::time::timeout(Duration::from_millis(20), signal.changed())
                .await
                .is_err(),
            "a burst must not leave a second wakeup behind"
        );
    }
}
