use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::record::SessionId;
use crate::snapshot::Snapshot;
use crate::storage::traits::{SnapshotStore, StorageError};

use super::codec::{read_frame, write_frame};
use super::file_lock::StoreLock;
use super::PersistentConfig;

const SNAPSHOT_EXT: &str = "snap";

/// File-backed snapshot store: one CRC-framed file per session.
///
/// Writes go to a temporary file which is then renamed over the session
/// file, so a crash leaves either the old or the new snapshot, never a torn
/// one.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    cfg: PersistentConfig,
    latest: Mutex<Option<Snapshot>>,
    _lock: StoreLock,
}

impl FileSnapshotStore {
    /// Opens (creating if needed) and locks a snapshot directory.
    ///
    /// The most recent readable snapshot is loaded; corrupt files are
    /// skipped with a warning.
    pub fn open(dir: &Path, cfg: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("create snapshot dir", &e))?;
        let lock = StoreLock::acquire(dir)?;

        let mut latest: Option<Snapshot> = None;
        let entries = fs::read_dir(dir).map_err(|e| io_err("scan snapshot dir", &e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_err("scan snapshot dir", &e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            match read_snapshot(&path) {
                Ok(snapshot) => {
                    if latest.as_ref().map_or(true, |cur| snapshot.published_at > cur.published_at) {
                        latest = Some(snapshot);
                    }
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable snapshot file"),
            }
        }

        debug!(dir = %dir.display(), restored = latest.is_some(), "snapshot store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            cfg,
            latest: Mutex::new(latest),
            _lock: lock,
        })
    }

    /// Directory holding the snapshot files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.{SNAPSHOT_EXT}"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn upsert(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let target = self.session_path(snapshot.session_id);
        let tmp = target.with_extension("tmp");

        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| io_err("open snapshot temp file", &e))?;
            let mut writer = BufWriter::new(file);
            write_frame(&mut writer, snapshot).map_err(|e| StorageError::SerializationError(e.to_string()))?;
            writer.flush().map_err(|e| io_err("flush snapshot", &e))?;
            if self.cfg.sync_on_write {
                writer
                    .get_ref()
                    .sync_all()
                    .map_err(|e| io_err("sync snapshot", &e))?;
            }
        }
        fs::rename(&tmp, &target).map_err(|e| io_err("replace snapshot file", &e))?;

        let mut latest = self
            .latest
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: snapshot.latest".to_string()))?;
        *latest = Some(snapshot.clone());
        Ok(())
    }

    fn get(&self, session_id: SessionId) -> Result<Option<Snapshot>, StorageError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        read_snapshot(&path).map(Some)
    }

    fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        let latest = self
            .latest
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: snapshot.latest".to_string()))?;
        Ok(latest.clone())
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, StorageError> {
    let file = File::open(path).map_err(|e| io_err("open snapshot file", &e))?;
    read_frame(&mut BufReader::new(file)).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::record::{PatientField, PatientRecord, PatientStatus};

    fn snap(session_id: SessionId, seq: u64, phone: &str) -> Snapshot {
        let mut record = PatientRecord::new();
        record.set(PatientField::Phone, phone);
        Snapshot::new(session_id, seq, record)
    }

    #[test]
    fn upsert_then_get_per_session() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let session = SessionId::new();

        assert!(store.get(session).unwrap().is_none());
        store.upsert(&snap(session, 1, "08")).unwrap();
        store.upsert(&snap(session, 2, "081")).unwrap();

        assert_eq!(store.get(session).unwrap().unwrap().record.phone, "081");
        assert_eq!(store.latest().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn reopen_restores_latest() {
        let dir = tempdir().unwrap();
        let session = SessionId::new();
        {
            let store = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap();
            let mut s = snap(session, 4, "0812");
            s.record.status = PatientStatus::Submitted;
            store.upsert(&s).unwrap();
        }

        let store = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.session_id, session);
        assert_eq!(latest.status(), PatientStatus::Submitted);
    }

    #[test]
    fn corrupt_file_is_skipped_on_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(format!("{}.snap", SessionId::new())), b"garbage").unwrap();

        let store = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn second_open_is_refused_while_locked() {
        let dir = tempdir().unwrap();
        let _first = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let err = FileSnapshotStore::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }), "{err}");
    }
}
