//! Intake session: the patient-side owner of one record.
//!
//! All transitions of the record run under one mutex, and the resulting
//! snapshot is published before the mutex is released. The publish order is
//! therefore the mutation order, for edits from the form and for idle
//! timeouts fired by the activity monitor alike.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, info, warn};

use crate::activity::ActivityMonitor;
use crate::channel::{DistributionChannel, SubscriptionId};
use crate::config::IntakeConfig;
use crate::error::{lock_poisoned, ChannelError, IntakeError, IntakeResult};
use crate::observer::ObserverSession;
use crate::persistence::PersistenceWorker;
use crate::publisher::ChangePublisher;
use crate::record::{PatientField, PatientRecord, PatientStatus, SessionId};
use crate::snapshot::Snapshot;
use crate::storage::SnapshotStore;
use crate::store::RecordStore;
use crate::summary::{SummaryService, SUMMARY_PLACEHOLDER};
use crate::validation::{IntakeFormValidator, SubmissionValidator};

/// Builder for [`IntakeSession`].
pub struct IntakeSessionBuilder {
    channel: Arc<dyn DistributionChannel>,
    config: IntakeConfig,
    session_id: Option<SessionId>,
    persistence: Option<Arc<dyn SnapshotStore>>,
    restore_latest: bool,
    summary: Option<SummaryService>,
    validator: Option<Arc<dyn SubmissionValidator>>,
}

impl IntakeSessionBuilder {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: IntakeConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a caller-chosen identity for the first session.
    #[must_use]
    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Hands every published snapshot to `store` in the background.
    #[must_use]
    pub fn persistence(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Resumes the latest stored record instead of starting empty.
    ///
    /// Only has an effect together with [`Self::persistence`].
    #[must_use]
    pub fn restore_latest(mut self, restore: bool) -> Self {
        self.restore_latest = restore;
        self
    }

    /// Enables [`IntakeSession::summary`].
    #[must_use]
    pub fn summary(mut self, service: SummaryService) -> Self {
        self.summary = Some(service);
        self
    }

    /// Replaces the default [`IntakeFormValidator`].
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn SubmissionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validates the configuration and starts the session's workers.
    pub fn build(self) -> IntakeResult<IntakeSession> {
        let config = self.config.validate()?;

        let mut publisher = ChangePublisher::new(Arc::clone(&self.channel));
        if let Some(last) = self.channel.last_snapshot() {
            publisher.resume_from(last.sequence);
        }

        let mut store = self.session_id.map_or_else(RecordStore::new, RecordStore::with_session);
        if let Some(backend) = &self.persistence {
            if let Some(latest) = backend.latest()? {
                publisher.resume_from(latest.sequence);
                if self.restore_latest {
                    store = RecordStore::restore(latest.session_id, latest.record);
                }
            }
            let worker = PersistenceWorker::start(config.persistence.clone(), Arc::clone(backend))?;
            publisher = publisher.with_persistence(worker);
        }

        let validator = match self.validator {
            Some(validator) => validator,
            None => Arc::new(IntakeFormValidator::new()?),
        };

        let slot: Arc<OnceLock<Weak<SessionCore>>> = Arc::new(OnceLock::new());
        let timer_slot = Arc::clone(&slot);
        let monitor = ActivityMonitor::start(config.activity.clone(), move |generation| {
            if let Some(core) = timer_slot.get().and_then(Weak::upgrade) {
                core.expire(generation);
            }
        })?;

        if store.status() == PatientStatus::Active && store.record() != &PatientRecord::new() {
            monitor.on_edit(store.generation())?;
        }

        let session_id = store.session_id();
        let core = Arc::new(SessionCore {
            config,
            store: Mutex::new(store),
            publisher,
            monitor,
            validator,
            summary: self.summary,
            owned: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        // The slot is fresh, so this cannot fail.
        let _ = slot.set(Arc::downgrade(&core));

        info!(%session_id, "intake session started");
        Ok(IntakeSession { core })
    }
}

struct SessionCore {
    config: IntakeConfig,
    store: Mutex<RecordStore>,
    publisher: ChangePublisher,
    monitor: ActivityMonitor,
    validator: Arc<dyn SubmissionValidator>,
    summary: Option<SummaryService>,
    owned: Mutex<Vec<SubscriptionId>>,
    closed: AtomicBool,
}

impl SessionCore {
    fn lock(&self) -> IntakeResult<MutexGuard<'_, RecordStore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Disconnected {
                path: "intake_session".to_string(),
            }
            .into());
        }
        self.store.lock().map_err(|_| lock_poisoned("session record"))
    }

    fn publish(&self, store: &RecordStore, record: PatientRecord) -> IntakeResult<Snapshot> {
        self.publisher.publish(store.session_id(), record)
    }

    /// Idle-timer callback. Runs on the monitor thread.
    fn expire(&self, generation: u64) {
        let Ok(mut store) = self.lock() else {
            return;
        };
        if let Some(record) = store.mark_inactive(generation) {
            if let Err(err) = self.publish(&store, record) {
                warn!(session_id = %store.session_id(), error = %err, "idle transition not published");
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.monitor.cancel();

        let owned: Vec<SubscriptionId> = self
            .owned
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();
        for subscription_id in owned {
            // Observers that already unsubscribed themselves are fine.
            if let Err(err) = self.publisher.channel().unsubscribe(subscription_id) {
                debug!(%subscription_id, error = %err, "owned observer already gone");
            }
        }
        debug!("intake session closed");
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The explicitly owned state of one patient intake.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct IntakeSession {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for IntakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never blocks on the record lock.
        let session_id = self.core.store.try_lock().ok().map(|store| store.session_id());
        f.debug_struct("IntakeSession")
            .field("session_id", &session_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl IntakeSession {
    /// Starts building a session that publishes to `channel`.
    #[must_use]
    pub fn builder(channel: Arc<dyn DistributionChannel>) -> IntakeSessionBuilder {
        IntakeSessionBuilder {
            channel,
            config: IntakeConfig::default(),
            session_id: None,
            persistence: None,
            restore_latest: false,
            summary: None,
            validator: None,
        }
    }

    /// A session with the given configuration and no collaborators.
    pub fn new(channel: Arc<dyn DistributionChannel>, config: IntakeConfig) -> IntakeResult<Self> {
        Self::builder(channel).config(config).build()
    }

    /// Sets one field, forces `active`, restarts the idle timer, publishes.
    ///
    /// # Errors
    /// `RecordError::ImmutableRecord` once submitted; nothing is published.
    pub fn apply_edit(&self, field: PatientField, value: impl Into<String>) -> IntakeResult<Snapshot> {
        let mut store = self.core.lock()?;
        let record = store.apply_edit(field, value).map_err(|err| {
            debug!(error = %err, "edit ignored");
            IntakeError::from(err)
        })?;
        self.core.monitor.on_edit(store.generation())?;
        self.core.publish(&store, record)
    }

    /// Like [`Self::apply_edit`] with the field given by its wire name.
    pub fn apply_edit_named(&self, field: &str, value: impl Into<String>) -> IntakeResult<Snapshot> {
        let field = field.parse::<PatientField>()?;
        self.apply_edit(field, value)
    }

    /// Ingests a full-record update from the form.
    ///
    /// An incoming `submitted` status submits the record; any other status
    /// is handled as an edit.
    pub fn ingest(&self, incoming: &PatientRecord) -> IntakeResult<Snapshot> {
        let mut store = self.core.lock()?;
        let record = store.replace(incoming).map_err(|err| {
            debug!(error = %err, "update ignored");
            IntakeError::from(err)
        })?;
        if record.status.is_terminal() {
            self.core.monitor.cancel()?;
            info!(session_id = %store.session_id(), "intake submitted");
        } else {
            self.core.monitor.on_edit(store.generation())?;
        }
        self.core.publish(&store, record)
    }

    /// Transitions to `submitted` and publishes.
    ///
    /// Returns `None` without publishing if the record was already
    /// submitted.
    pub fn mark_submitted(&self) -> IntakeResult<Option<Snapshot>> {
        let mut store = self.core.lock()?;
        self.submit_locked(&mut store)
    }

    /// Runs the submission validator, then submits.
    ///
    /// # Errors
    /// `ValidationError::Submission` with every failing field; the record
    /// stays editable and nothing is published.
    pub fn submit_validated(&self) -> IntakeResult<Option<Snapshot>> {
        let mut store = self.core.lock()?;
        if store.status().is_terminal() {
            return Ok(None);
        }
        self.core.validator.check(store.record())?;
        self.submit_locked(&mut store)
    }

    fn submit_locked(&self, store: &mut RecordStore) -> IntakeResult<Option<Snapshot>> {
        if store.status().is_terminal() {
            debug!(session_id = %store.session_id(), "already submitted");
            return Ok(None);
        }
        let record = store.mark_submitted();
        self.core.monitor.cancel()?;
        info!(session_id = %store.session_id(), "intake submitted");
        self.core.publish(store, record).map(Some)
    }

    /// Clears the form and starts a new patient session.
    pub fn reset(&self) -> IntakeResult<Snapshot> {
        let mut store = self.core.lock()?;
        let record = store.reset();
        self.core.monitor.on_edit(store.generation())?;
        info!(session_id = %store.session_id(), "intake reset");
        self.core.publish(&store, record)
    }

    /// Subscribes a staff observer that this session unsubscribes on close.
    pub fn observe(&self) -> IntakeResult<ObserverSession> {
        if self.is_closed() {
            return Err(ChannelError::Disconnected {
                path: "intake_session".to_string(),
            }
            .into());
        }
        let observer = ObserverSession::subscribe(
            self.core.publisher.channel().as_ref(),
            self.core.config.required_fields.clone(),
        )?;
        self.core
            .owned
            .lock()
            .map_err(|_| lock_poisoned("session observers"))?
            .push(observer.subscription_id());
        Ok(observer)
    }

    /// Summary of the current record, or the placeholder text on failure.
    pub fn summary(&self) -> IntakeResult<String> {
        let record = self.record()?;
        match &self.core.summary {
            Some(service) => Ok(service.summarize(&record)),
            None => {
                warn!("summary requested but no generator is configured");
                Ok(SUMMARY_PLACEHOLDER.to_string())
            }
        }
    }

    /// Identity of the current patient session.
    pub fn session_id(&self) -> IntakeResult<SessionId> {
        Ok(self.core.lock()?.session_id())
    }

    /// Copy of the current record.
    pub fn record(&self) -> IntakeResult<PatientRecord> {
        Ok(self.core.lock()?.record().clone())
    }

    /// Current status.
    pub fn status(&self) -> IntakeResult<PatientStatus> {
        Ok(self.core.lock()?.status())
    }

    /// The current record stamped with the last published sequence.
    ///
    /// Nothing is broadcast.
    pub fn current_snapshot(&self) -> IntakeResult<Snapshot> {
        let store = self.core.lock()?;
        Ok(Snapshot::new(
            store.session_id(),
            self.core.publisher.last_sequence(),
            store.record().clone(),
        ))
    }

    /// Completion of the current record against the configured fields.
    pub fn completion_percentage(&self) -> IntakeResult<u8> {
        let store = self.core.lock()?;
        Ok(self.core.config.required_fields.completion_percentage(store.record()))
    }

    /// Returns true while the idle timer is armed.
    #[must_use]
    pub fn idle_timer_pending(&self) -> bool {
        self.core.monitor.is_pending()
    }

    /// The session's publisher.
    #[must_use]
    pub fn publisher(&self) -> &ChangePublisher {
        &self.core.publisher
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &IntakeConfig {
        &self.core.config
    }

    /// Cancels the idle timer and unsubscribes every observer created by
    /// [`Self::observe`]. Idempotent; later operations fail.
    pub fn close(&self) {
        self.core.shutdown();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }
}
