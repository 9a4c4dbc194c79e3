//! # intake-relay - realtime patient-intake synchronization
//!
//! A patient fills in an intake form; staff watch the same record live.
//! This crate owns that shared record and keeps every observer converged on
//! its latest state.
//!
//! ## Core Concepts
//!
//! - **PatientRecord**: the form fields plus an activity status
//!   (`active`, `inactive`, `submitted`)
//! - **IntakeSession**: the single writer of one record. Every transition is
//!   published as a full [`Snapshot`], never a diff
//! - **ActivityMonitor**: demotes an untouched record to `inactive` after the
//!   idle window
//! - **DistributionChannel**: fans snapshots out to observers in one global
//!   order, in process or through a store's change feed
//! - **ObserverSession**: the staff-side view with completion percentage and
//!   submission time
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use intake_relay::{ChannelConfig, InProcessChannel, IntakeConfig, IntakeSession, PatientField};
//!
//! let channel = Arc::new(InProcessChannel::new(ChannelConfig::default()));
//! let session = IntakeSession::new(channel.clone(), IntakeConfig::default())?;
//! let mut staff = session.observe()?;
//!
//! session.apply_edit(PatientField::FirstName, "Ada")?;
//! staff.try_drain()?;
//! assert_eq!(staff.completion_percentage(), 20);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod wire;

// Realtime pipeline
pub mod activity;
pub mod channel;
pub mod observer;
pub mod publisher;
pub mod session;

// Collaborators and configuration
pub mod completion;
pub mod config;
pub mod persistence;
pub mod storage;
pub mod summary;
pub mod validation;

/// gRPC transport (requires the `transport-grpc` feature).
#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use activity::{ActivityConfig, ActivityMonitor};
pub use channel::{
    BroadcastReport, ChangeFeedChannel, ChannelConfig, DeliveryError, DistributionChannel, InProcessChannel,
    ObserverHandle, QueueSink, SnapshotSink, SubscriptionId,
};
pub use completion::RequiredFields;
pub use config::IntakeConfig;
pub use error::{
    ChannelError, CollaboratorError, FieldIssue, IntakeError, IntakeResult, RecordError, ValidationError,
};
pub use observer::ObserverSession;
pub use persistence::{PersistenceConfig, PersistenceWorker};
pub use publisher::ChangePublisher;
pub use record::{PatientField, PatientRecord, PatientStatus, SessionId};
pub use session::{IntakeSession, IntakeSessionBuilder};
pub use snapshot::Snapshot;
pub use storage::{ChangeFeed, ChangeFeedStore, InMemorySnapshotStore, SnapshotStore, StorageError};
pub use store::RecordStore;
pub use summary::{SummaryGenerator, SummaryRequest, SummaryService, SUMMARY_PLACEHOLDER};
pub use validation::{AcceptAll, IntakeFormValidator, SubmissionValidator};
pub use wire::WireMessage;
