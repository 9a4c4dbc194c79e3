//! Snapshot storage: the external persistence collaborator.
//!
//! The relay never reads from storage on the broadcast path. Stores are fed
//! from a background worker ([`crate::persistence::PersistenceWorker`]) or
//! act as the transport of a change-feed channel.

mod memory;
mod traits;

/// File-backed store (requires the `persistent` feature).
#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemorySnapshotStore;
pub use traits::{ChangeFeed, ChangeFeedStore, SnapshotStore, StorageError};
