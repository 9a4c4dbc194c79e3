//! Abstract snapshot storage traits.
//!
//! A snapshot store is the external persistence collaborator: it keeps the
//! last written snapshot per session ("last write wins") and nothing more.
//! Stores that can also push change notifications implement
//! [`ChangeFeedStore`] and can back a change-feed distribution channel.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::error::CollaboratorError;
use crate::record::SessionId;
use crate::snapshot::Snapshot;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The store is unreachable or closed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Another relay process owns the snapshot directory.
    #[error("Snapshot directory {dir} is locked by another process (holder pid: {holder:?})")]
    Locked {
        /// The contended directory.
        dir: String,
        /// Pid recorded by the holder, when readable.
        holder: Option<u32>,
    },
}

impl From<StorageError> for CollaboratorError {
    fn from(err: StorageError) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for crate::error::IntakeError {
    fn from(err: StorageError) -> Self {
        Self::Collaborator(err.into())
    }
}

/// Durable home for published snapshots, keyed by session.
///
/// # Safety Considerations
/// - Implementations must be safe to call from a background worker thread
/// - `upsert` must never block on readers
pub trait SnapshotStore: Send + Sync {
    /// Stores `snapshot` as the current state of its session.
    fn upsert(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// The stored snapshot for one session.
    fn get(&self, session_id: SessionId) -> Result<Option<Snapshot>, StorageError>;

    /// The most recently written snapshot across all sessions.
    fn latest(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// Receiving end of a store's change feed.
///
/// The store keeps a weak reference to the feed's liveness token and stops
/// notifying once the feed is dropped.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: Receiver<Snapshot>,
    _alive: Arc<()>,
}

impl ChangeFeed {
    /// Wraps a notification receiver together with its liveness token.
    #[must_use]
    pub fn new(rx: Receiver<Snapshot>, alive: Arc<()>) -> Self {
        Self { rx, _alive: alive }
    }

    /// The notification queue, for use in `select!`.
    #[must_use]
    pub const fn receiver(&self) -> &Receiver<Snapshot> {
        &self.rx
    }
}

/// A snapshot store that publishes every upsert as a change notification.
pub trait ChangeFeedStore: SnapshotStore {
    /// Opens a change feed. Every later upsert is sent to the feed in write
    /// order. A feed that falls `capacity` behind loses its oldest pending
    /// notifications, never the newest, so a draining watcher always ends on
    /// the last write.
    fn watch(&self, capacity: usize) -> Result<ChangeFeed, StorageError>;
}
