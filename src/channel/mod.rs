//! Distribution channel: fan-out of snapshots to observers.
//!
//! A channel is polymorphic over {subscribe, unsubscribe, broadcast}. Two
//! transport bindings exist:
//!
//! - [`InProcessChannel`]: direct broadcast relay. Snapshots are delivered to
//!   every subscribed sink inside `broadcast`.
//! - [`ChangeFeedChannel`]: broadcast is an upsert to an external snapshot
//!   store; a feed worker relays the store's change notifications to local
//!   observers.
//!
//! Every observer sits behind a bounded queue. A slow observer loses its
//! oldest undelivered snapshots instead of stalling the publisher.

/// Change-feed transport binding.
pub mod feed;
/// In-process transport binding.
pub mod local;
/// Observer stream handle and the default queue sink.
pub mod stream;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{IntakeResult, ValidationError};
use crate::snapshot::Snapshot;

pub use feed::ChangeFeedChannel;
pub use local::InProcessChannel;
pub use stream::{ObserverHandle, QueueSink};

/// Unique identifier for a subscription (the observer's connection identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Deliver the most recent snapshot to a newly subscribed observer.
    pub replay_last_on_subscribe: bool,
    /// Per-observer queue capacity. On overflow the oldest queued snapshot is dropped.
    pub observer_queue_capacity: usize,
    /// Capacity of the change-feed queue between the store and the feed worker.
    pub feed_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            replay_last_on_subscribe: true,
            observer_queue_capacity: 1024,
            feed_queue_capacity: 4096,
        }
    }
}

impl ChannelConfig {
    /// Checks that every capacity is usable.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` if a capacity is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.observer_queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "observer_queue_capacity must be at least 1".to_string(),
            });
        }
        if self.feed_queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "feed_queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Why a single delivery failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The observer is gone; the channel prunes it.
    #[error("observer closed")]
    Closed,
    /// The observer refused this snapshot; it stays subscribed.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// An endpoint that receives snapshots from a channel.
///
/// `deliver` is called while the channel holds its ordering lock, so
/// implementations must not block.
pub trait SnapshotSink: Send + Sync {
    /// Hands one snapshot to the observer.
    fn deliver(&self, snapshot: &Snapshot) -> Result<(), DeliveryError>;
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Observers that accepted the snapshot.
    pub delivered: usize,
    /// Observers whose delivery failed but who remain subscribed.
    pub failed: usize,
    /// Observers removed because they were closed.
    pub pruned: usize,
}

/// The capability set shared by every transport binding.
pub trait DistributionChannel: Send + Sync {
    /// Subscribes a queue-backed observer and returns its handle.
    ///
    /// With `replay_last_on_subscribe`, the last broadcast snapshot (if any)
    /// is the first item on the handle.
    fn subscribe(&self) -> IntakeResult<ObserverHandle>;

    /// Subscribes a custom sink.
    fn subscribe_sink(&self, sink: Arc<dyn SnapshotSink>) -> IntakeResult<SubscriptionId>;

    /// Removes an observer.
    ///
    /// # Errors
    /// `ChannelError::SubscriptionNotFound` for an unknown id; callers treat
    /// it as a no-op.
    fn unsubscribe(&self, subscription_id: SubscriptionId) -> IntakeResult<()>;

    /// Delivers `snapshot` to every currently subscribed observer.
    fn broadcast(&self, snapshot: Snapshot) -> IntakeResult<BroadcastReport>;

    /// The most recently broadcast snapshot.
    fn last_snapshot(&self) -> Option<Snapshot>;

    /// Number of subscribed observers.
    fn observer_count(&self) -> usize;
}
