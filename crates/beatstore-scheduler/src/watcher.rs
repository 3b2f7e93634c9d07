use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{error::Result, store::PeriodicStore, types::TaskEntry};

/// A fresh copy of the enabled entries, sent whenever the ledger moves.
#[derive(Debug, Clone, PartialEq)]
pub struct Reload {
    /// Ledger stamp the entries were read under.
    pub last_update: Option<DateTime<Utc>>,
    pub entries: Vec<TaskEntry>,
}

/// Polls the change ledger and reloads the enabled entries when it moves.
///
/// The first poll always reloads. After that only a ledger stamp different
/// from the last one seen triggers a reload.
#[derive(Debug, Default)]
pub struct ChangeWatcher {
    last_seen: Option<DateTime<Utc>>,
    primed: bool,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp of the last reload, if any.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Check the ledger once. Returns `Some` when the entries should be
    /// reloaded, carrying the reloaded set.
    pub fn poll(&mut self, store: &PeriodicStore) -> Result<Option<Reload>> {
        let current = store.last_change_timestamp()?;
        if self.primed && current == self.last_seen {
            return Ok(None);
        }
        let (last_update, entries) = store.enabled_snapshot()?;
        self.last_seen = last_update;
        self.primed = true;
        info!(
            entries = entries.len(),
            last_update = ?last_update,
            "periodic tasks changed, reloaded"
        );
        Ok(Some(Reload {
            last_update,
            entries,
        }))
    }

    /// Poll every `poll_interval` and forward reloads to `tx` until
    /// `shutdown` broadcasts `true` or the receiver goes away.
    pub async fn run(
        mut self,
        store: Arc<PeriodicStore>,
        poll_interval: Duration,
        tx: mpsc::Sender<Reload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(?poll_interval, "change watcher started");
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll(&store) {
                        Ok(Some(reload)) => {
                            if tx.send(reload).await.is_err() {
                                warn!("reload receiver dropped, change watcher stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!("change watcher poll error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("change watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{IntervalPeriod, NewTask, Notify, ScheduleRef, TaskUpdate};
    use chrono::TimeZone;
    use rusqlite::Connection;

    fn store() -> PeriodicStore {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        PeriodicStore::with_clock(Connection::open_in_memory().unwrap(), clock).unwrap()
    }

    fn add_task(store: &PeriodicStore, name: &str) -> i64 {
        let interval = store
            .get_or_create_interval(10, IntervalPeriod::Seconds)
            .unwrap();
        store
            .create_task(&NewTask::new(name, "echo", ScheduleRef::Interval(interval.id)))
            .unwrap()
            .id
    }

    #[test]
    fn first_poll_always_reloads() {
        let store = store();
        let mut watcher = ChangeWatcher::new();
        let reload = watcher.poll(&store).unwrap().unwrap();
        assert_eq!(reload.last_update, None);
        assert!(reload.entries.is_empty());
        assert!(watcher.poll(&store).unwrap().is_none());
    }

    #[test]
    fn reloads_only_after_published_changes() {
        let store = store();
        let id = add_task(&store, "a");
        let mut watcher = ChangeWatcher::new();
        assert_eq!(watcher.poll(&store).unwrap().unwrap().entries.len(), 1);
        assert!(watcher.poll(&store).unwrap().is_none());

        let quiet = TaskUpdate {
            description: Some("x".into()),
            ..TaskUpdate::default()
        };
        store.update_task(id, &quiet, Notify::Suppress).unwrap();
        assert!(watcher.poll(&store).unwrap().is_none());

        store.set_enabled(id, false).unwrap();
        let reload = watcher.poll(&store).unwrap().unwrap();
        assert!(reload.entries.is_empty());
        assert_eq!(watcher.last_seen(), store.last_change_timestamp().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn run_forwards_reloads_and_stops_on_shutdown() {
        let store = Arc::new(store());
        add_task(&store, "a");

        let (tx, mut rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ChangeWatcher::new().run(
            store.clone(),
            Duration::from_secs(1),
            tx,
            shutdown_rx,
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.entries.len(), 1);

        add_task(&store, "b");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.entries.len(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
