//! Change publisher: turns every state transition into one snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::channel::DistributionChannel;
use crate::error::IntakeResult;
use crate::persistence::PersistenceWorker;
use crate::record::{PatientRecord, SessionId};
use crate::snapshot::Snapshot;

/// Stamps records into snapshots and forwards them to a channel.
///
/// The publisher does no batching or coalescing: one call, one snapshot,
/// one broadcast. Callers serialize calls per record so that the sequence
/// order equals the mutation order.
pub struct ChangePublisher {
    channel: Arc<dyn DistributionChannel>,
    sequence: AtomicU64,
    persistence: Option<PersistenceWorker>,
}

impl std::fmt::Debug for ChangePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePublisher")
            .field("sequence", &self.last_sequence())
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl ChangePublisher {
    /// Publishes to `channel`, with no persistence.
    #[must_use]
    pub fn new(channel: Arc<dyn DistributionChannel>) -> Self {
        Self {
            channel,
            sequence: AtomicU64::new(0),
            persistence: None,
        }
    }

    /// Also hands every snapshot to a persistence worker.
    #[must_use]
    pub fn with_persistence(mut self, worker: PersistenceWorker) -> Self {
        self.persistence = Some(worker);
        self
    }

    /// Continues numbering after `sequence`, e.g. the last persisted one.
    ///
    /// Never moves the counter backwards.
    pub fn resume_from(&self, sequence: u64) {
        self.sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Sequence number of the last published snapshot (0 before the first).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// The channel snapshots go to.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn DistributionChannel> {
        &self.channel
    }

    /// The persistence worker, if one is attached.
    #[must_use]
    pub fn persistence(&self) -> Option<&PersistenceWorker> {
        self.persistence.as_ref()
    }

    /// Stamps `record` and broadcasts it.
    ///
    /// Persistence is best-effort and never delays or fails the broadcast.
    ///
    /// # Errors
    /// Whatever the channel's `broadcast` returns.
    pub fn publish(&self, session_id: SessionId, record: PatientRecord) -> IntakeResult<Snapshot> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Snapshot::new(session_id, sequence, record);

        match self.channel.broadcast(snapshot.clone()) {
            Ok(report) => {
                trace!(
                    %session_id,
                    sequence,
                    status = %snapshot.status(),
                    delivered = report.delivered,
                    failed = report.failed,
                    "snapshot published"
                );
            }
            Err(err) => {
                warn!(%session_id, sequence, error = %err, "broadcast failed");
                return Err(err);
            }
        }

        if let Some(worker) = &self.persistence {
            worker.submit(&snapshot);
        }
        Ok(snapshot)
    }
}
