//! Snapshots: the immutable unit of propagation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{PatientRecord, PatientStatus, SessionId};

/// An immutable copy of a record as of one state transition.
///
/// Every observer owns its own clone; nothing in a snapshot is shared
/// mutably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Session the record belongs to.
    pub session_id: SessionId,
    /// Publisher sequence number; strictly increasing per publisher.
    pub sequence: u64,
    /// Wall-clock publish time.
    pub published_at: DateTime<Utc>,
    /// The full record.
    #[serde(flatten)]
    pub record: PatientRecord,
}

impl Snapshot {
    /// Creates a snapshot stamped with the current time.
    #[must_use]
    pub fn new(session_id: SessionId, sequence: u64, record: PatientRecord) -> Self {
        Self {
            session_id,
            sequence,
            published_at: Utc::now(),
            record,
        }
    }

    /// Status carried by this snapshot.
    #[must_use]
    pub const fn status(&self) -> PatientStatus {
        self.record.status
    }

    /// Returns true if the snapshot carries the terminal status.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.record.status.is_terminal()
    }

    /// Returns true if `self` was published after `other`.
    #[must_use]
    pub const fn is_newer_than(&self, other: &Self) -> bool {
        self.sequence > other.sequence
    }
}
