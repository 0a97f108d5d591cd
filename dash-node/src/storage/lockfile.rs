//! Exclusive lock on the node's data directory.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// Name of the lock file inside the data directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Holds an OS-level lock on `<data_dir>/.lock` for as long as it lives, so two
/// node processes never append to the same record files.
///
/// The file holds the PID of the node owning the lock. A file left behind by a
/// node that died is not locked and is simply taken over.
#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    _file: File,
}

impl DataDirLock {
    pub fn acquire(data_dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(data_dir).map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        // Not truncated before locking: the current holder's PID stays readable.
        let path = data_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::WriteFailed(format!("Failed to create lock file: {}", e)))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = read_pid(&mut file)
                    .map(|pid| format!(" (pid {})", pid))
                    .unwrap_or_default();
                return Err(StorageError::DirectoryLocked(format!(
                    "Data directory '{}' is already in use by another node{}",
                    data_dir.display(),
                    holder
                )));
            }
            Err(TryLockError::Error(e)) => {
                return Err(StorageError::WriteFailed(format!("Failed to acquire lock: {}", e)))
            }
        }

        if let Err(e) = write_pid(&mut file) {
            tracing::warn!("Failed to write PID to lock file: {}", e);
        }

        Ok(Self {
            path,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file: {}", e);
        }
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_data()
}
