//! In-memory snapshot store.
//!
//! Thread-safe implementation of [`SnapshotStore`] and [`ChangeFeedStore`].
//! Intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::record::SessionId;
use crate::snapshot::Snapshot;
use crate::storage::traits::{ChangeFeed, ChangeFeedStore, SnapshotStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Store side of one change feed. The receiver clone lets the store evict
/// the oldest pending notification when the watcher falls behind.
#[derive(Debug)]
struct Watcher {
    tx: Sender<Snapshot>,
    evict_rx: Receiver<Snapshot>,
    alive: Weak<()>,
}

impl Watcher {
    /// Queues `snapshot`, evicting the oldest pending one if full.
    /// Returns `false` once the feed has been dropped.
    fn push(&self, snapshot: &Snapshot, dropped: &AtomicU64) -> bool {
        if self.alive.strong_count() == 0 {
            return false;
        }
        let mut pending = snapshot.clone();
        // Upserts hold the watcher lock, so the store is the only sender and
        // an eviction always frees the slot for the retry.
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if self.evict_rx.try_recv().is_ok() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    by_session: HashMap<SessionId, Snapshot>,
    latest: Option<SessionId>,
}

/// Thread-safe in-memory snapshot store with a change feed.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    state: RwLock<SnapshotState>,
    watchers: Mutex<Vec<Watcher>>,
    writes: AtomicU64,
    dropped_notifications: AtomicU64,
}

impl InMemorySnapshotStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upserts.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Stale change notifications evicted because a watcher fell behind.
    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// Number of sessions with a stored snapshot.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.read().map(|s| s.by_session.len()).unwrap_or(0)
    }

    fn notify(&self, watchers: &mut Vec<Watcher>, snapshot: &Snapshot) {
        let before = self.dropped_notifications.load(Ordering::Relaxed);
        watchers.retain(|watcher| watcher.push(snapshot, &self.dropped_notifications));
        if self.dropped_notifications.load(Ordering::Relaxed) != before {
            warn!(sequence = snapshot.sequence, "change feed watcher lagging; oldest notification evicted");
        }
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn upsert(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        // Held for the whole write so notifications follow write order.
        let mut watchers = self.watchers.lock().map_err(|_| lock_err("snapshot.watchers"))?;
        {
            let mut state = self.state.write().map_err(|_| lock_err("snapshot.upsert"))?;
            state.by_session.insert(snapshot.session_id, snapshot.clone());
            state.latest = Some(snapshot.session_id);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(&mut watchers, snapshot);
        Ok(())
    }

    fn get(&self, session_id: SessionId) -> Result<Option<Snapshot>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("snapshot.get"))?;
        Ok(state.by_session.get(&session_id).cloned())
    }

    fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("snapshot.latest"))?;
        Ok(state.latest.and_then(|id| state.by_session.get(&id).cloned()))
    }
}

impl ChangeFeedStore for InMemorySnapshotStore {
    fn watch(&self, capacity: usize) -> Result<ChangeFeed, StorageError> {
        let (tx, rx) = bounded::<Snapshot>(capacity.max(1));
        let alive = Arc::new(());
        self.watchers.lock().map_err(|_| lock_err("snapshot.watch"))?.push(Watcher {
            tx,
            evict_rx: rx.clone(),
            alive: Arc::downgrade(&alive),
        });
        Ok(ChangeFeed::new(rx, alive))
    }
}
