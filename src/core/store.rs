//! TTL-indexed entry store
//!
//! Holds every admitted key with its jump target and expiry. A background
//! sweep (owned by the store and aborted when it drops) removes expired
//! entries and reports each one on the event channel returned by
//! [`EntryStore::new`]. By the time `StoreEvent::Expired` is received the key
//! is already gone from the store.
//!
//! The store uses `tokio::time::Instant`, so tests can drive expiry with a
//! paused clock.

use crate::core::error::Error;
use crate::core::snapshot::{self, SnapshotEntry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// A single admitted key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEntry {
    pub target: String,
    pub expires_at: Instant,
}

impl ManagedEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Out-of-band notifications from the store
#[derive(Debug)]
pub enum StoreEvent {
    /// The entry's TTL elapsed and it has been removed
    Expired { key: String, target: String },
    /// An internal fault not tied to any caller (snapshot persistence)
    Error(Error),
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, ManagedEntry>,
    dirty: bool,
}

/// Returns the sweep period for a TTL: a tenth of it, rounded up to whole seconds.
pub fn sweep_interval_for(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs().div_ceil(10).max(1))
}

/// In-memory key → target map with per-entry expiry
#[derive(Debug)]
pub struct EntryStore {
    state: Arc<Mutex<StoreState>>,
    ttl: Duration,
    sweep_interval: Duration,
    sweeper: JoinHandle<()>,
}

impl EntryStore {
    /// Creates the store and starts its sweep task.
    ///
    /// When `snapshot_path` is set, the sweep also persists the entries there
    /// whenever they changed since the previous sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        ttl: Duration,
        snapshot_path: Option<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let state = Arc::new(Mutex::new(StoreState::default()));
        let sweep_interval = sweep_interval_for(ttl);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&state),
            sweep_interval,
            events_tx,
            snapshot_path,
        ));

        let store = Self {
            state,
            ttl,
            sweep_interval,
            sweeper,
        };
        (store, events_rx)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// True if the key is present and its TTL has not elapsed.
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.state()
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.target.clone())
    }

    /// Inserts or refreshes an entry; the expiry becomes now + TTL either way.
    pub fn set(&self, key: &str, target: &str) {
        let entry = ManagedEntry {
            target: target.to_string(),
            expires_at: Instant::now() + self.ttl,
        };
        let mut state = self.state();
        state.entries.insert(key.to_string(), entry);
        state.dirty = true;
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state();
        let existed = state.entries.remove(key).is_some();
        state.dirty |= existed;
        existed
    }

    /// Snapshot of all live entries as `(key, target)`, sorted by key.
    pub fn list(&self) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut live: Vec<(String, String)> = self
            .state()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.target.clone()))
            .collect();
        live.sort();
        live
    }

    /// Removes the entry if its TTL has elapsed, returning its target.
    ///
    /// The sweep will not report an entry taken this way.
    pub fn take_if_expired(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state();
        if state.entries.get(key)?.is_live(now) {
            return None;
        }
        let entry = state.entries.remove(key)?;
        state.dirty = true;
        Some(entry.target)
    }

    /// Removes every entry. No expiry notifications are emitted.
    pub fn flush(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EntryStore {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Removes expired entries under the lock, returning them in key order.
fn take_expired(state: &Mutex<StoreState>, now: Instant) -> Vec<(String, String)> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

    let mut expired: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| !entry.is_live(now))
        .map(|(key, _)| key.clone())
        .collect();
    expired.sort();

    let removed: Vec<(String, String)> = expired
        .into_iter()
        .filter_map(|key| {
            let entry = state.entries.remove(&key)?;
            Some((key, entry.target))
        })
        .collect();

    state.dirty |= !removed.is_empty();
    removed
}

/// Returns the persisted form of the entries if they changed since the last call.
fn take_dirty_snapshot(state: &Mutex<StoreState>, now: Instant) -> Option<Vec<SnapshotEntry>> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if !state.dirty {
        return None;
    }
    state.dirty = false;

    let wall_now = chrono::Utc::now();
    let mut entries: Vec<SnapshotEntry> = state
        .entries
        .iter()
        .map(|(key, entry)| {
            let remaining = entry.expires_at.saturating_duration_since(now);
            SnapshotEntry {
                key: key.clone(),
                target: entry.target.clone(),
                expires_at: wall_now
                    + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero()),
            }
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Some(entries)
}

async fn sweep_loop(
    state: Arc<Mutex<StoreState>>,
    period: Duration,
    events: mpsc::UnboundedSender<StoreEvent>,
    snapshot_path: Option<PathBuf>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Instant::now();

        for (key, target) in take_expired(&state, now) {
            debug!(key = %key, "Entry expired");
            if events.send(StoreEvent::Expired { key, target }).is_err() {
                // Owner is gone
                return;
            }
        }

        let Some(path) = &snapshot_path else {
            continue;
        };
        if let Some(entries) = take_dirty_snapshot(&state, now)
            && let Err(e) = snapshot::save(path, &entries)
        {
            warn!("Failed to persist entry snapshot to {}: {e}", path.display());
            // Retry on the next sweep
            state.lock().unwrap_or_else(PoisonError::into_inner).dirty = true;
            if events.send(StoreEvent::Error(e)).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_is_tenth_of_ttl_rounded_up() {
        assert_eq!(sweep_interval_for(Duration::from_secs(300)), Duration::from_secs(30));
        assert_eq!(sweep_interval_for(Duration::from_secs(25)), Duration::from_secs(3));
        assert_eq!(sweep_interval_for(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(sweep_interval_for(Duration::from_secs(0)), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_delete() {
        let (store, _events) = EntryStore::new(Duration::from_secs(60), None);

        assert!(!store.exists("10.0.0.1"));
        store.set("10.0.0.1", "ACCEPT");
        assert!(store.exists("10.0.0.1"));
        assert_eq!(store.get("10.0.0.1").as_deref(), Some("ACCEPT"));

        assert!(store.delete("10.0.0.1"));
        assert!(!store.delete("10.0.0.1"));
        assert!(store.get("10.0.0.1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_live_before_sweep() {
        let (store, _events) = EntryStore::new(Duration::from_secs(10), None);
        store.set("10.0.0.1", "ACCEPT");

        // Reads treat the entry as gone whether or not the sweep got to it yet
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!store.exists("10.0.0.1"));
        assert!(store.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_emits_expired_once_after_removal() {
        let (store, mut events) = EntryStore::new(Duration::from_secs(30), None);
        store.set("10.0.0.1", "ACCEPT");
        store.set("10.0.0.2", "DROP");

        let event = events.recv().await.unwrap();
        match event {
            StoreEvent::Expired { key, target } => {
                assert_eq!(key, "10.0.0.1");
                assert_eq!(target, "ACCEPT");
            }
            StoreEvent::Error(e) => panic!("unexpected error: {e}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::Expired { ref key, .. } if key == "10.0.0.2"
        ));
        assert!(store.is_empty());

        // Nothing else is pending
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_pushes_expiry_out() {
        let (store, mut events) = EntryStore::new(Duration::from_secs(30), None);
        store.set("10.0.0.1", "ACCEPT");

        tokio::time::sleep(Duration::from_secs(20)).await;
        store.set("10.0.0.1", "ACCEPT");
        tokio::time::sleep(Duration::from_secs(20)).await;

        // 40s after admission, 20s after refresh: still live
        assert!(store.exists("10.0.0.1"));
        assert!(events.try_recv().is_err());

        let event = events.recv().await.unwrap();
        assert!(matches!(event, StoreEvent::Expired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_if_expired_before_sweep() {
        // Sweeps run every 10s from t=0
        let (store, mut events) = EntryStore::new(Duration::from_secs(100), None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.set("10.0.0.1", "DROP");
        store.set("10.0.0.2", "ACCEPT");
        assert!(store.take_if_expired("10.0.0.1").is_none());

        // Expired at t=105, next sweep at t=110
        tokio::time::sleep(Duration::from_secs(102)).await;
        store.set("10.0.0.2", "ACCEPT");
        assert_eq!(store.take_if_expired("10.0.0.1").as_deref(), Some("DROP"));
        assert!(store.take_if_expired("10.0.0.1").is_none());
        assert!(store.take_if_expired("10.0.0.2").is_none());

        // The sweep has nothing left to report for it
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_emits_nothing() {
        let (store, mut events) = EntryStore::new(Duration::from_secs(5), None);
        store.set("10.0.0.1", "ACCEPT");
        store.set("10.0.0.2", "ACCEPT");
        store.flush();

        assert!(store.list().is_empty());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_is_sorted_snapshot() {
        let (store, _events) = EntryStore::new(Duration::from_secs(60), None);
        store.set("10.0.0.2", "ACCEPT");
        store.set("10.0.0.1", "DROP");

        assert_eq!(
            store.list(),
            vec![
                ("10.0.0.1".to_string(), "DROP".to_string()),
                ("10.0.0.2".to_string(), "ACCEPT".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_store_stops_sweep() {
        let (store, mut events) = EntryStore::new(Duration::from_secs(5), None);
        store.set("10.0.0.1", "ACCEPT");
        drop(store);

        // Sweeper aborted, so the sender is dropped and the channel closes
        assert!(events.recv().await.is_none());
    }
}
