//! Change-feed transport binding.
//!
//! `broadcast` writes the snapshot to an external [`ChangeFeedStore`]; a
//! dedicated worker consumes the store's change notifications and relays
//! them to locally subscribed observers through an [`InProcessChannel`].
//! Delivery is therefore asynchronous with respect to `broadcast`, but the
//! store's write order is preserved end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{CollaboratorError, IntakeError, IntakeResult};
use crate::snapshot::Snapshot;
use crate::storage::{ChangeFeed, ChangeFeedStore};

use super::{BroadcastReport, ChannelConfig, DistributionChannel, InProcessChannel, ObserverHandle, SnapshotSink, SubscriptionId};

/// Distribution channel backed by an external store's change feed.
pub struct ChangeFeedChannel {
    store: Arc<dyn ChangeFeedStore>,
    local: InProcessChannel,
    relayed: Arc<AtomicU64>,
    shutdown_tx: Option<Sender<()>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChangeFeedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedChannel")
            .field("local", &self.local)
            .field("relayed", &self.relayed())
            .finish_non_exhaustive()
    }
}

impl ChangeFeedChannel {
    /// Opens a change feed on `store` and starts the relay worker.
    ///
    /// With `replay_last_on_subscribe`, the store's latest snapshot seeds the
    /// replay slot so observers connecting after a restart still see the
    /// last known state.
    ///
    /// The feed is opened before the store is read, so a write landing in
    /// between is relayed rather than lost. Seeding never replaces a newer
    /// snapshot.
    pub fn new(cfg: ChannelConfig, store: Arc<dyn ChangeFeedStore>) -> IntakeResult<Self> {
        let cfg = cfg.validate()?;
        let local = InProcessChannel::new(cfg.clone());

        let feed = store.watch(cfg.feed_queue_capacity)?;
        if cfg.replay_last_on_subscribe {
            if let Some(snapshot) = store.latest()? {
                local.seed_last(snapshot)?;
            }
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let relayed = Arc::new(AtomicU64::new(0));

        let worker_local = local.clone();
        let worker_relayed = Arc::clone(&relayed);
        let join = thread::Builder::new()
            .name("intake-feed".to_string())
            .spawn(move || feed_loop(&worker_local, &worker_relayed, &feed, &shutdown_rx))
            .map_err(|e| IntakeError::internal(format!("failed to spawn feed worker: {e}")))?;

        Ok(Self {
            store,
            local,
            relayed,
            shutdown_tx: Some(shutdown_tx),
            join: Mutex::new(Some(join)),
        })
    }

    /// Snapshots relayed from the feed to local observers.
    #[must_use]
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

impl DistributionChannel for ChangeFeedChannel {
    fn subscribe(&self) -> IntakeResult<ObserverHandle> {
        self.local.subscribe()
    }

    fn subscribe_sink(&self, sink: Arc<dyn SnapshotSink>) -> IntakeResult<SubscriptionId> {
        self.local.subscribe_sink(sink)
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) -> IntakeResult<()> {
        self.local.unsubscribe(subscription_id)
    }

    fn broadcast(&self, snapshot: Snapshot) -> IntakeResult<BroadcastReport> {
        self.store.upsert(&snapshot).map_err(|err| {
            warn!(sequence = snapshot.sequence, error = %err, "change feed upsert failed");
            IntakeError::Collaborator(CollaboratorError::from(err))
        })?;
        // Fan-out happens on the feed worker.
        Ok(BroadcastReport::default())
    }

    fn last_snapshot(&self) -> Option<Snapshot> {
        self.local.last_snapshot()
    }

    fn observer_count(&self) -> usize {
        self.local.observer_count()
    }
}

impl Drop for ChangeFeedChannel {
    fn drop(&mut self) {
        // Closing the shutdown channel stops the worker even if the store
        // outlives this channel and keeps the feed open.
        drop(self.shutdown_tx.take());
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn feed_loop(local: &InProcessChannel, relayed: &AtomicU64, feed: &ChangeFeed, shutdown_rx: &Receiver<()>) {
    loop {
        select! {
            recv(feed.receiver()) -> msg => match msg {
                Ok(snapshot) => {
                    let sequence = snapshot.sequence;
                    match local.broadcast(snapshot) {
                        Ok(_) => {
                            relayed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => warn!(sequence, error = %err, "change feed relay failed"),
                    }
                }
                Err(_) => {
                    debug!("change feed closed by store");
                    break;
                }
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
}
