//! Single-writer guard for a snapshot directory.
//!
//! `<dir>/.lock` carries a non-blocking OS lock for as long as the store is
//! open, plus the holder's pid so a refused open can say who owns the
//! directory. A clean release empties the file. The OS drops the lock when
//! the holder exits, so a pid left behind by a crashed relay is simply taken
//! over.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::storage::traits::StorageError;

const LOCK_FILE: &str = ".lock";

/// Exclusive hold on a snapshot directory; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
    previous_holder: Option<u32>,
}

impl StoreLock {
    /// Takes the directory for this process.
    ///
    /// # Errors
    /// - `StorageError::Locked` if a live relay already holds it
    /// - `StorageError::BackendError` if the lock file cannot be opened or written
    pub fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_io("open lock file", &e))?;

        let recorded = read_holder(&mut file);
        if !try_lock_exclusive(&file).map_err(|e| lock_io("lock snapshot dir", &e))? {
            return Err(StorageError::Locked {
                dir: dir.display().to_string(),
                holder: recorded,
            });
        }

        if let Some(pid) = recorded {
            info!(dir = %dir.display(), stale_pid = pid, "taking over snapshot dir from exited relay");
        }

        let pid = std::process::id();
        file.set_len(0).map_err(|e| lock_io("reset lock file", &e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| lock_io("reset lock file", &e))?;
        writeln!(file, "{pid}").map_err(|e| lock_io("record lock holder", &e))?;
        file.flush().map_err(|e| lock_io("record lock holder", &e))?;
        debug!(path = %path.display(), pid, "snapshot dir locked");

        Ok(Self {
            file,
            path,
            previous_holder: recorded,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid left in the lock file by an earlier holder that no longer runs.
    #[must_use]
    pub const fn previous_holder(&self) -> Option<u32> {
        self.previous_holder
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the handle releases the OS lock.
        let _ = self.file.set_len(0);
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn lock_io(context: &str, err: &IoError) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

/// `Ok(false)` when another process holds the lock.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> Result<bool, IoError> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

/// `Ok(false)` when another process holds the lock.
#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> Result<bool, IoError> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY, 0, 1, 0, &mut overlapped)
    };
    if result != 0 {
        return Ok(true);
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(any(unix, windows)))]
fn try_lock_exclusive(_file: &File) -> Result<bool, IoError> {
    Err(IoError::new(
        std::io::ErrorKind::Unsupported,
        "snapshot dir locking is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn lock_file_records_this_process() {
        let dir = tempdir().unwrap();
        let lock = StoreLock::acquire(dir.path()).unwrap();

        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        assert_eq!(lock.previous_holder(), None);
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_names_the_holder() {
        let dir = tempdir().unwrap();
        let _held = StoreLock::acquire(dir.path()).unwrap();

        match StoreLock::acquire(dir.path()).unwrap_err() {
            StorageError::Locked { holder, .. } => assert_eq!(holder, Some(std::process::id())),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_from_crashed_relay_is_taken_over() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "424242\n").unwrap();

        let lock = StoreLock::acquire(dir.path()).unwrap();
        assert_eq!(lock.previous_holder(), Some(424_242));
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(StoreLock::acquire(dir.path()).unwrap());
        let again = StoreLock::acquire(dir.path()).unwrap();
        assert_eq!(again.previous_holder(), None);
    }
}
