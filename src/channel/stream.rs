use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{ChannelError, IntakeResult};
use crate::snapshot::Snapshot;

use super::{DeliveryError, SnapshotSink, SubscriptionId};

/// Removes subscriptions on behalf of a dropped or closed handle.
pub(crate) trait ObserverRegistry: Send + Sync {
    fn detach(&self, subscription_id: SubscriptionId);
}

/// Bounded queue sink with drop-oldest overflow.
///
/// The sink keeps its own receiver clone so it can evict the oldest queued
/// snapshot when the observer falls behind. Because of that, closure is
/// signalled through a shared flag rather than channel disconnection.
#[derive(Debug)]
pub struct QueueSink {
    tx: Sender<Snapshot>,
    evict_rx: Receiver<Snapshot>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl QueueSink {
    pub(crate) fn pair(capacity: usize) -> (Self, Receiver<Snapshot>, Arc<AtomicBool>, Arc<AtomicU64>) {
        let (tx, rx) = bounded::<Snapshot>(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = Self {
            tx,
            evict_rx: rx.clone(),
            closed: Arc::clone(&closed),
            dropped: Arc::clone(&dropped),
        };
        (sink, rx, closed, dropped)
    }

    /// Snapshots evicted from this queue so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SnapshotSink for QueueSink {
    fn deliver(&self, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        let mut pending = snapshot.clone();
        // Evicting one snapshot frees a slot, so the second attempt only fails
        // if another sender refilled it in between.
        for _ in 0..2 {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    if self.evict_rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(DeliveryError::Closed),
            }
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        Err(DeliveryError::Rejected("observer queue saturated".to_string()))
    }
}

/// A staff-side subscription handle.
///
/// Dropping the handle unsubscribes it (best effort, non-blocking).
pub struct ObserverHandle {
    subscription_id: SubscriptionId,
    rx: Receiver<Snapshot>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    registry: Weak<dyn ObserverRegistry>,
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("subscription_id", &self.subscription_id)
            .field("queued", &self.rx.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ObserverHandle {
    pub(crate) fn new(
        subscription_id: SubscriptionId,
        rx: Receiver<Snapshot>,
        closed: Arc<AtomicBool>,
        dropped: Arc<AtomicU64>,
        registry: Weak<dyn ObserverRegistry>,
    ) -> Self {
        Self {
            subscription_id,
            rx,
            closed,
            dropped,
            registry,
        }
    }

    /// The subscription id backing this handle.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Snapshots evicted from this observer's queue because it fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns true once `unsubscribe` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Explicit unsubscription. Idempotent and non-blocking.
    ///
    /// Snapshots already queued remain readable; afterwards the handle
    /// reports `Disconnected`.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.subscription_id);
        }
    }

    /// Receive the next snapshot (blocking).
    pub fn recv(&self) -> IntakeResult<Snapshot> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next snapshot with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> IntakeResult<Snapshot> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ChannelError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into(),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Non-blocking receive. `Ok(None)` means nothing is queued right now.
    pub fn try_recv(&self) -> IntakeResult<Option<Snapshot>> {
        match self.rx.try_recv() {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn disconnected() -> crate::error::IntakeError {
    ChannelError::Disconnected {
        path: "observer_stream".to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PatientRecord, SessionId};

    fn snap(seq: u64) -> Snapshot {
        Snapshot::new(SessionId::nil(), seq, PatientRecord::new())
    }

    #[test]
    fn queue_sink_drops_oldest_on_overflow() {
        let (sink, rx, _closed, dropped) = QueueSink::pair(2);
        for seq in 1..=5 {
            sink.deliver(&snap(seq)).unwrap();
        }

        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        assert_eq!(sink.dropped(), 3);
        let kept: Vec<u64> = rx.try_iter().map(|s| s.sequence).collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[test]
    fn queue_sink_reports_closed() {
        let (sink, _rx, closed, _dropped) = QueueSink::pair(4);
        closed.store(true, Ordering::Release);
        assert_eq!(sink.deliver(&snap(1)), Err(DeliveryError::Closed));
    }
}
