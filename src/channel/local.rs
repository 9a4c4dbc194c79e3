use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::error::{lock_poisoned, ChannelError, IntakeError, IntakeResult};
use crate::snapshot::Snapshot;

use super::stream::{ObserverRegistry, QueueSink};
use super::{BroadcastReport, ChannelConfig, DeliveryError, DistributionChannel, ObserverHandle, SnapshotSink, SubscriptionId};

/// Direct broadcast relay.
///
/// `broadcast` and `subscribe` share one ordering lock, so every observer
/// sees the same global order and a replaying subscriber never misses or
/// duplicates a snapshot published concurrently with its subscription.
#[derive(Clone)]
pub struct InProcessChannel {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    cfg: ChannelConfig,
    observers: RwLock<HashMap<SubscriptionId, Arc<dyn SnapshotSink>>>,
    /// Ordering lock; also guards the last broadcast snapshot.
    fanout: Mutex<Option<Snapshot>>,
    failed_deliveries: AtomicU64,
}

impl std::fmt::Debug for InProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessChannel")
            .field("cfg", &self.inner.cfg)
            .field("observers", &self.observer_count())
            .finish_non_exhaustive()
    }
}

impl ObserverRegistry for LocalInner {
    fn detach(&self, subscription_id: SubscriptionId) {
        let removed = self
            .observers
            .write()
            .map(|mut guard| guard.remove(&subscription_id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(%subscription_id, "observer detached");
        }
    }
}

impl InProcessChannel {
    /// Creates a channel. The config should already be validated.
    #[must_use]
    pub fn new(cfg: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                cfg,
                observers: RwLock::new(HashMap::new()),
                fanout: Mutex::new(None),
                failed_deliveries: AtomicU64::new(0),
            }),
        }
    }

    /// The channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.cfg
    }

    /// Total deliveries that failed without pruning the observer.
    #[must_use]
    pub fn failed_deliveries(&self) -> u64 {
        self.inner.failed_deliveries.load(Ordering::Relaxed)
    }

    /// Seeds the replay slot without delivering to anyone.
    ///
    /// Used by the change-feed binding to restore the last known state from
    /// its store at startup. An older snapshot never replaces a newer one.
    pub fn seed_last(&self, snapshot: Snapshot) -> IntakeResult<()> {
        let mut last = self.inner.fanout.lock().map_err(|_| lock_poisoned("channel fanout"))?;
        let replace = last.as_ref().map_or(true, |cur| snapshot.is_newer_than(cur));
        if replace {
            *last = Some(snapshot);
        }
        Ok(())
    }

    fn register(&self, sink: Arc<dyn SnapshotSink>) -> IntakeResult<SubscriptionId> {
        let subscription_id = SubscriptionId::new();
        let last = self.inner.fanout.lock().map_err(|_| lock_poisoned("channel fanout"))?;

        self.inner
            .observers
            .write()
            .map_err(|_| lock_poisoned("channel observers"))?
            .insert(subscription_id, Arc::clone(&sink));

        if self.inner.cfg.replay_last_on_subscribe {
            if let Some(snapshot) = last.as_ref() {
                if let Err(err) = sink.deliver(snapshot) {
                    self.inner.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    warn!(%subscription_id, error = %err, "replay to new observer failed");
                }
            }
        }

        debug!(%subscription_id, replay = self.inner.cfg.replay_last_on_subscribe, "observer subscribed");
        Ok(subscription_id)
    }
}

impl DistributionChannel for InProcessChannel {
    fn subscribe(&self) -> IntakeResult<ObserverHandle> {
        let (sink, rx, closed, dropped) = QueueSink::pair(self.inner.cfg.observer_queue_capacity);
        let subscription_id = self.register(Arc::new(sink))?;
        let registry: Arc<dyn ObserverRegistry> = Arc::clone(&self.inner) as Arc<dyn ObserverRegistry>;
        Ok(ObserverHandle::new(
            subscription_id,
            rx,
            closed,
            dropped,
            Arc::downgrade(&registry),
        ))
    }

    fn subscribe_sink(&self, sink: Arc<dyn SnapshotSink>) -> IntakeResult<SubscriptionId> {
        self.register(sink)
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) -> IntakeResult<()> {
        let removed = self
            .inner
            .observers
            .write()
            .map_err(|_| lock_poisoned("channel observers"))?
            .remove(&subscription_id)
            .is_some();

        if removed {
            debug!(%subscription_id, "observer unsubscribed");
            Ok(())
        } else {
            Err(IntakeError::Channel(ChannelError::SubscriptionNotFound { subscription_id }))
        }
    }

    fn broadcast(&self, snapshot: Snapshot) -> IntakeResult<BroadcastReport> {
        let mut last = self.inner.fanout.lock().map_err(|_| lock_poisoned("channel fanout"))?;

        // Copy the observer set so (un)subscribe can proceed during fan-out.
        let targets: Vec<(SubscriptionId, Arc<dyn SnapshotSink>)> = self
            .inner
            .observers
            .read()
            .map_err(|_| lock_poisoned("channel observers"))?
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        for (subscription_id, sink) in targets {
            match sink.deliver(&snapshot) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Closed) => closed.push(subscription_id),
                Err(DeliveryError::Rejected(reason)) => {
                    report.failed += 1;
                    self.inner.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    let err = ChannelError::Delivery { subscription_id, reason };
                    warn!(error = %err, sequence = snapshot.sequence, "observer delivery failed");
                }
            }
        }

        if !closed.is_empty() {
            let mut observers = self.inner.observers.write().map_err(|_| lock_poisoned("channel observers"))?;
            for id in &closed {
                if observers.remove(id).is_some() {
                    report.pruned += 1;
                }
            }
            debug!(pruned = report.pruned, "pruned closed observers");
        }

        *last = Some(snapshot);
        Ok(report)
    }

    fn last_snapshot(&self) -> Option<Snapshot> {
        self.inner.fanout.lock().ok().and_then(|guard| guard.clone())
    }

    fn observer_count(&self) -> usize {
        self.inner.observers.read().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::record::{PatientRecord, SessionId};

    fn snap(seq: u64) -> Snapshot {
        Snapshot::new(SessionId::nil(), seq, PatientRecord::new())
    }

    struct FailingSink;

    impl SnapshotSink for FailingSink {
        fn deliver(&self, _snapshot: &Snapshot) -> Result<(), DeliveryError> {
            Err(DeliveryError::Rejected("socket write failed".to_string()))
        }
    }

    #[test]
    fn broadcast_reaches_every_observer_in_order() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        let a = channel.subscribe().unwrap();
        let b = channel.subscribe().unwrap();

        for seq in 1..=3 {
            let report = channel.broadcast(snap(seq)).unwrap();
            assert_eq!(report.delivered, 2);
        }

        for handle in [&a, &b] {
            let seqs: Vec<u64> = (0..3).map(|_| handle.try_recv().unwrap().unwrap().sequence).collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }

    #[test]
    fn replay_delivers_last_snapshot_to_late_subscriber() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        channel.broadcast(snap(1)).unwrap();
        channel.broadcast(snap(2)).unwrap();

        let late = channel.subscribe().unwrap();
        assert_eq!(late.recv_timeout(Duration::from_millis(100)).unwrap().sequence, 2);
        assert!(late.try_recv().unwrap().is_none());
    }

    #[test]
    fn no_replay_when_disabled() {
        let channel = InProcessChannel::new(ChannelConfig {
            replay_last_on_subscribe: false,
            ..ChannelConfig::default()
        });
        channel.broadcast(snap(1)).unwrap();

        let late = channel.subscribe().unwrap();
        assert!(late.try_recv().unwrap().is_none());

        channel.broadcast(snap(2)).unwrap();
        assert_eq!(late.try_recv().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn failing_observer_is_isolated() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        let failing_id = channel.subscribe_sink(Arc::new(FailingSink)).unwrap();
        let healthy = channel.subscribe().unwrap();

        let report = channel.broadcast(snap(1)).unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1, pruned: 0 });

        let report = channel.broadcast(snap(2)).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(channel.observer_count(), 2);
        assert_eq!(channel.failed_deliveries(), 2);

        assert_eq!(healthy.try_recv().unwrap().unwrap().sequence, 1);
        assert_eq!(healthy.try_recv().unwrap().unwrap().sequence, 2);
        channel.unsubscribe(failing_id).unwrap();
    }

    #[test]
    fn unknown_unsubscribe_is_reported_not_fatal() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        let err = channel.unsubscribe(SubscriptionId::new()).unwrap_err();
        assert!(err.is_recoverable());
        channel.broadcast(snap(1)).unwrap();
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        let handle = channel.subscribe().unwrap();
        assert_eq!(channel.observer_count(), 1);
        drop(handle);
        assert_eq!(channel.observer_count(), 0);
    }

    #[test]
    fn unsubscribed_handle_disconnects_after_draining() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        let handle = channel.subscribe().unwrap();
        channel.broadcast(snap(1)).unwrap();
        handle.unsubscribe();
        handle.unsubscribe();

        channel.broadcast(snap(2)).unwrap();
        assert_eq!(handle.try_recv().unwrap().unwrap().sequence, 1);
        let err = handle.recv_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, IntakeError::Channel(ChannelError::Disconnected { .. })));
    }

    #[test]
    fn seed_last_keeps_newest() {
        let channel = InProcessChannel::new(ChannelConfig::default());
        channel.seed_last(snap(5)).unwrap();
        channel.seed_last(snap(3)).unwrap();
        assert_eq!(channel.last_snapshot().unwrap().sequence, 5);
        assert_eq!(channel.observer_count(), 0);
    }
}
