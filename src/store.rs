//! Record store: the authoritative state of one patient session.
//!
//! The store itself is a plain state machine over `&mut self`. The owning
//! `IntakeSession` wraps it in a mutex together with publishing, so the
//! publish order always equals the mutation order.

use tracing::debug;

use crate::error::RecordError;
use crate::record::{PatientField, PatientRecord, PatientStatus, SessionId};

/// Authoritative holder of the current record and its status.
#[derive(Debug, Clone)]
pub struct RecordStore {
    session_id: SessionId,
    record: PatientRecord,
    generation: u64,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    /// Starts a fresh session: empty record, status `active`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_session(SessionId::new())
    }

    /// Starts a fresh session with a caller-chosen identity.
    #[must_use]
    pub fn with_session(session_id: SessionId) -> Self {
        Self {
            session_id,
            record: PatientRecord::new(),
            generation: 0,
        }
    }

    /// Resumes a session from a previously published record.
    #[must_use]
    pub fn restore(session_id: SessionId, record: PatientRecord) -> Self {
        debug!(%session_id, status = %record.status, "record restored");
        Self {
            session_id,
            record,
            generation: 0,
        }
    }

    /// Identity of the current session.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The current record.
    #[must_use]
    pub const fn record(&self) -> &PatientRecord {
        &self.record
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> PatientStatus {
        self.record.status
    }

    /// Activity generation; bumped by every transition that restarts or ends
    /// the idle period.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Sets a field and forces status to `active`.
    ///
    /// # Errors
    /// `RecordError::ImmutableRecord` once the record is submitted.
    pub fn apply_edit(&mut self, field: PatientField, value: impl Into<String>) -> Result<PatientRecord, RecordError> {
        self.ensure_mutable()?;
        self.record.set(field, value);
        self.record.status = PatientStatus::Active;
        self.generation += 1;
        debug!(session_id = %self.session_id, %field, generation = self.generation, "record edited");
        Ok(self.record.clone())
    }

    /// Replaces every field with the values from a full-record update.
    ///
    /// An incoming `submitted` status submits the record; any other status
    /// is treated as an edit and forces `active`.
    ///
    /// # Errors
    /// `RecordError::ImmutableRecord` once the record is submitted.
    pub fn replace(&mut self, incoming: &PatientRecord) -> Result<PatientRecord, RecordError> {
        self.ensure_mutable()?;
        self.record.copy_fields_from(incoming);
        if incoming.status.is_terminal() {
            return Ok(self.mark_submitted());
        }
        self.record.status = PatientStatus::Active;
        self.generation += 1;
        debug!(session_id = %self.session_id, generation = self.generation, "record replaced");
        Ok(self.record.clone())
    }

    /// Transitions to `submitted`. Calling it again is a no-op.
    pub fn mark_submitted(&mut self) -> PatientRecord {
        if !self.record.status.is_terminal() {
            self.record.status = PatientStatus::Submitted;
            self.generation += 1;
            debug!(session_id = %self.session_id, "record submitted");
        }
        self.record.clone()
    }

    /// Demotes `active` to `inactive` if `generation` is still current.
    ///
    /// Returns `None` (no transition) when the record was edited since the
    /// timer was armed, is already inactive, or is submitted.
    pub fn mark_inactive(&mut self, generation: u64) -> Option<PatientRecord> {
        if generation != self.generation || self.record.status != PatientStatus::Active {
            return None;
        }
        self.record.status = PatientStatus::Inactive;
        debug!(session_id = %self.session_id, generation, "record went idle");
        Some(self.record.clone())
    }

    /// Clears all fields and starts a new session identity.
    pub fn reset(&mut self) -> PatientRecord {
        self.session_id = SessionId::new();
        self.record = PatientRecord::new();
        self.generation += 1;
        debug!(session_id = %self.session_id, "record reset");
        self.record.clone()
    }

    fn ensure_mutable(&self) -> Result<(), RecordError> {
        if self.record.status.is_terminal() {
            return Err(RecordError::ImmutableRecord {
                session_id: self.session_id,
            });
        }
        Ok(())
    }
}
