//! Observer session: the staff-side view of the latest record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::channel::{DistributionChannel, ObserverHandle, SubscriptionId};
use crate::completion::RequiredFields;
use crate::error::{ChannelError, IntakeError, IntakeResult};
use crate::record::{PatientStatus, SessionId};
use crate::snapshot::Snapshot;

/// A staff dashboard's view of the shared record.
///
/// The session converges on the latest snapshot: anything it has already
/// seen (same session, sequence not newer) is ignored, so a replay after
/// resubscribing never moves the view backwards.
#[derive(Debug)]
pub struct ObserverSession {
    handle: ObserverHandle,
    required: RequiredFields,
    last_snapshot: Option<Snapshot>,
    last_updated_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    ignored: u64,
}

impl ObserverSession {
    /// Subscribes to `channel`.
    pub fn subscribe(channel: &dyn DistributionChannel, required: RequiredFields) -> IntakeResult<Self> {
        Ok(Self::from_handle(channel.subscribe()?, required))
    }

    /// Wraps an existing subscription.
    #[must_use]
    pub fn from_handle(handle: ObserverHandle, required: RequiredFields) -> Self {
        Self {
            handle,
            required,
            last_snapshot: None,
            last_updated_at: None,
            submitted_at: None,
            ignored: 0,
        }
    }

    /// The subscription backing this view.
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.handle.subscription_id()
    }

    /// Latest applied snapshot.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// When the latest snapshot was applied.
    #[must_use]
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated_at
    }

    /// When a `submitted` snapshot was first applied for the current session.
    #[must_use]
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Session of the latest snapshot.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.last_snapshot.as_ref().map(|s| s.session_id)
    }

    /// Status of the latest snapshot.
    #[must_use]
    pub fn status(&self) -> Option<PatientStatus> {
        self.last_snapshot.as_ref().map(Snapshot::status)
    }

    /// Snapshots ignored as already seen.
    #[must_use]
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    /// Snapshots the channel evicted because this observer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.handle.dropped()
    }

    /// The configured required fields.
    #[must_use]
    pub fn required_fields(&self) -> &RequiredFields {
        &self.required
    }

    /// Completion of the latest record; 0 before the first snapshot.
    #[must_use]
    pub fn completion_percentage(&self) -> u8 {
        self.last_snapshot
            .as_ref()
            .map_or(0, |s| self.required.completion_percentage(&s.record))
    }

    /// Applies one snapshot. Returns false if it was already seen.
    pub fn apply(&mut self, snapshot: Snapshot) -> bool {
        let now = Utc::now();
        if let Some(last) = &self.last_snapshot {
            if last.session_id == snapshot.session_id {
                if !snapshot.is_newer_than(last) {
                    self.ignored += 1;
                    trace!(sequence = snapshot.sequence, "stale snapshot ignored");
                    return false;
                }
            } else {
                // A new patient session starts with a fresh submission clock.
                self.submitted_at = None;
            }
        }

        if snapshot.is_submitted() && self.submitted_at.is_none() {
            self.submitted_at = Some(now);
        }
        self.last_updated_at = Some(now);
        self.last_snapshot = Some(snapshot);
        true
    }

    /// Waits up to `timeout` for the next snapshot and applies it.
    ///
    /// Returns the applied snapshot, or `None` if it was a stale duplicate.
    ///
    /// # Errors
    /// `ChannelError::Timeout` if nothing arrived; `ChannelError::Disconnected`
    /// once the channel is gone or the session was closed and drained.
    pub fn recv_timeout(&mut self, timeout: Duration) -> IntakeResult<Option<&Snapshot>> {
        let snapshot = self.handle.recv_timeout(timeout)?;
        if self.apply(snapshot) {
            Ok(self.last_snapshot.as_ref())
        } else {
            Ok(None)
        }
    }

    /// Applies everything currently queued. Returns how many were applied.
    pub fn try_drain(&mut self) -> IntakeResult<usize> {
        let mut applied = 0;
        loop {
            match self.handle.try_recv() {
                Ok(Some(snapshot)) => {
                    if self.apply(snapshot) {
                        applied += 1;
                    }
                }
                Ok(None) => return Ok(applied),
                Err(IntakeError::Channel(ChannelError::Disconnected { .. })) if applied > 0 => return Ok(applied),
                Err(err) => return Err(err),
            }
        }
    }

    /// Unsubscribes. Idempotent; the last view stays readable.
    pub fn close(&self) {
        self.handle.unsubscribe();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
