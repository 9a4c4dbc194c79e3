//! Background hand-off of snapshots to a [`SnapshotStore`].
//!
//! The publisher never writes to storage itself. It offers each snapshot to a
//! bounded queue with `try_send`; a full queue or a failing store is counted
//! and logged, and broadcast carries on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{CollaboratorError, IntakeError, IntakeResult, ValidationError};
use crate::snapshot::Snapshot;
use crate::storage::SnapshotStore;

/// Persistence hand-off configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Snapshots waiting for the store before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl PersistenceConfig {
    /// Rejects a zero-capacity queue.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "persistence queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Owns the persistence thread.
///
/// Dropping the worker closes the queue, lets the thread drain what is
/// already queued and joins it.
#[derive(Debug)]
pub struct PersistenceWorker {
    tx: Option<Sender<Snapshot>>,
    counters: Arc<Counters>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWorker {
    /// Starts the worker thread in front of `store`.
    pub fn start(cfg: PersistenceConfig, store: Arc<dyn SnapshotStore>) -> IntakeResult<Self> {
        let cfg = cfg.validate()?;
        let (tx, rx) = bounded::<Snapshot>(cfg.queue_capacity);
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let join = thread::Builder::new()
            .name("intake-persist".to_string())
            .spawn(move || persist_loop(&rx, store.as_ref(), &worker_counters))
            .map_err(|e| IntakeError::internal(format!("failed to spawn persistence worker: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            counters,
            join: Mutex::new(Some(join)),
        })
    }

    /// Offers a snapshot to the store without blocking.
    ///
    /// Returns false if the snapshot was dropped.
    pub fn submit(&self, snapshot: &Snapshot) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(s)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(sequence = s.sequence, "persistence queue full, snapshot dropped");
                false
            }
            Err(TrySendError::Disconnected(s)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(sequence = s.sequence, "persistence worker gone, snapshot dropped");
                false
            }
        }
    }

    /// Snapshots the store accepted.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    /// Snapshots dropped because the queue was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Snapshots the store rejected.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits until every queued snapshot was handled.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn persist_loop(rx: &Receiver<Snapshot>, store: &dyn SnapshotStore, counters: &Counters) {
    for snapshot in rx {
        match store.upsert(&snapshot) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let err = CollaboratorError::from(err);
                warn!(session_id = %snapshot.session_id, sequence = snapshot.sequence, error = %err, "snapshot not persisted");
            }
        }
    }
    debug!("persistence worker stopped");
}
