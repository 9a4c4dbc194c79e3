//! Durable snapshot store.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   .lock                  exclusive process lock (holder pid while open)
//!   <session-id>.snap      latest snapshot of one session (CRC-framed)
//! ```

mod codec;
mod file_lock;
mod store;

pub use file_lock::StoreLock;
pub use store::FileSnapshotStore;

use std::path::Path;

use crate::storage::traits::StorageError;

/// Configuration for the file-backed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

/// Open or create a snapshot directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - `StorageError::Locked` if another process holds the directory
///
/// # Example
/// ```rust,ignore
/// use intake_relay::storage::persistent::open_snapshot_store;
///
/// let store = open_snapshot_store("./intake-data", None)?;
/// ```
pub fn open_snapshot_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<FileSnapshotStore, StorageError> {
    FileSnapshotStore::open(path.as_ref(), config.unwrap_or_default())
}
