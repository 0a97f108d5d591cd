//! A single bounded, append-only record file.
//!
//! Records are laid out back to back as `u32 LE length || payload` with no
//! padding. The file's size is always the append position.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{trace, warn};

use super::types::RecordLocator;
use crate::error::{StorageError, StorageResult};

/// Size of the little-endian length prefix in front of every record.
pub const LENGTH_PREFIX_SIZE: u64 = 4;

struct FileState {
    file: File,
    size: u64,
}

/// Append-only file guarded by a read-write lock.
///
/// Reads share the lock and use their own file handle, so concurrent readers
/// never disturb the writer's cursor. Appends take the lock exclusively.
pub struct RecordFile {
    index: u32,
    path: PathBuf,
    max_size: u64,
    state: RwLock<FileState>,
}

impl RecordFile {
    /// Create a new, empty file. Fails if the file already exists.
    pub fn create(path: PathBuf, index: u32, max_size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StorageError::FileIo {
                path: path.clone(),
                source,
            })?;

        trace!("Created record file {}", path.display());

        Ok(Self {
            index,
            path,
            max_size,
            state: RwLock::new(FileState {
                file,
                size: 0,
            }),
        })
    }

    /// Open an existing file; the append position is its current length.
    pub fn open(path: PathBuf, index: u32, max_size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|source| {
            StorageError::FileIo {
                path: path.clone(),
                source,
            }
        })?;
        let size = file.metadata()?.len();

        Ok(Self {
            index,
            path,
            max_size,
            state: RwLock::new(FileState {
                file,
                size,
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current append position.
    pub fn size(&self) -> StorageResult<u64> {
        Ok(self.read_state()?.size)
    }

    /// Append a record at the end of the file.
    ///
    /// Returns `Ok(None)` without writing anything when the record does not fit
    /// under the file's maximum size.
    pub fn append(&self, payload: &[u8]) -> StorageResult<Option<RecordLocator>> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| StorageError::RecordTooLarge {
            size: payload.len() as u64,
            max_file_size: self.max_size,
        })?;
        let record_len = LENGTH_PREFIX_SIZE + payload_len as u64;

        let mut state = self.write_state()?;
        if state.size + record_len > self.max_size {
            return Ok(None);
        }

        // A reader must never have moved the writer handle, but verify anyway.
        let end = state.file.seek(SeekFrom::End(0))?;
        if end != state.size {
            return Err(StorageError::Corruption(format!(
                "{}: write cursor at {} but append position is {}",
                self.path.display(),
                end,
                state.size
            )));
        }

        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(payload);

        if let Err(e) = state.file.write_all(&buf) {
            // Never leave a torn record behind.
            let start = state.size;
            if let Err(rollback) = state.file.set_len(start) {
                warn!("Failed to roll back partial write in {}: {}", self.path.display(), rollback);
            }
            return Err(StorageError::WriteFailed(format!(
                "{}: failed to append {} bytes: {}",
                self.path.display(),
                record_len,
                e
            )));
        }

        let locator = RecordLocator {
            offset: state.size + LENGTH_PREFIX_SIZE,
            size: payload_len,
        };
        state.size += record_len;
        Ok(Some(locator))
    }

    /// Read exactly `locator.size` bytes at `locator.offset`.
    pub fn read(&self, locator: RecordLocator) -> StorageResult<Vec<u8>> {
        let state = self.read_state()?;
        let end = locator.offset + locator.size as u64;
        if locator.offset < LENGTH_PREFIX_SIZE || end > state.size {
            return Err(StorageError::NotFound(format!(
                "record {}+{} is outside {} ({} bytes)",
                locator.offset,
                locator.size,
                self.path.display(),
                state.size
            )));
        }

        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(locator.offset))?;
        let mut payload = vec![0u8; locator.size as usize];
        reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// fsync the file's data.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.write_state()?;
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Scan the records from the start and drop an incomplete trailing record left
    /// by an interrupted append. Returns the number of bytes removed.
    pub fn truncate_torn_tail(&self) -> StorageResult<u64> {
        let mut state = self.write_state()?;
        let valid_len = scan_valid_length(&self.path, state.size)?;
        let removed = state.size - valid_len;
        if removed > 0 {
            warn!(
                "Truncating {} bytes of incomplete record data from {}",
                removed,
                self.path.display()
            );
            state.file.set_len(valid_len)?;
            state.file.sync_data()?;
            state.size = valid_len;
        }
        Ok(removed)
    }

    /// Open a sequential reader over the records currently in the file.
    pub(crate) fn reader(&self) -> StorageResult<RecordReader> {
        let end = self.size()?;
        let file = File::open(&self.path)?;
        Ok(RecordReader {
            reader: BufReader::new(file),
            position: 0,
            end,
            path: self.path.clone(),
        })
    }

    fn read_state(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, FileState>> {
        self.state
            .read()
            .map_err(|_| StorageError::LockPoisoned(format!("record file {}", self.index)))
    }

    fn write_state(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, FileState>> {
        self.state
            .write()
            .map_err(|_| StorageError::LockPoisoned(format!("record file {}", self.index)))
    }
}

/// Sequential reader over a snapshot of a record file.
pub(crate) struct RecordReader {
    reader: BufReader<File>,
    position: u64,
    end: u64,
    path: PathBuf,
}

impl RecordReader {
    /// Next `(locator, payload)` pair, or `None` at the end of the snapshot.
    pub(crate) fn next_record(&mut self) -> StorageResult<Option<(RecordLocator, Vec<u8>)>> {
        if self.position >= self.end {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
        self.reader.read_exact(&mut prefix)?;
        let size = u32::from_le_bytes(prefix);
        let offset = self.position + LENGTH_PREFIX_SIZE;

        if offset + size as u64 > self.end {
            return Err(StorageError::Corruption(format!(
                "{}: record at {} claims {} bytes past end of file",
                self.path.display(),
                self.position,
                size
            )));
        }

        let mut payload = vec![0u8; size as usize];
        self.reader.read_exact(&mut payload)?;
        self.position = offset + size as u64;

        Ok(Some((
            RecordLocator {
                offset,
                size,
            },
            payload,
        )))
    }
}

/// Length of the prefix of the file made of complete records.
fn scan_valid_length(path: &Path, size: u64) -> StorageResult<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut position = 0u64;
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];

    while position < size {
        match reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let record_end = position + LENGTH_PREFIX_SIZE + u32::from_le_bytes(prefix) as u64;
        if record_end > size {
            break;
        }
        reader.seek_relative((record_end - position - LENGTH_PREFIX_SIZE) as i64)?;
        position = record_end;
    }

    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let file = RecordFile::create(temp_dir.path().join("f.dat"), 0, 1024).unwrap();

        let first = file.append(b"hello").unwrap().unwrap();
        let second = file.append(b"dash").unwrap().unwrap();

        assert_eq!(
            first,
            RecordLocator {
                offset: 4,
                size: 5
            }
        );
        assert_eq!(
            second,
            RecordLocator {
                offset: 13,
                size: 4
            }
        );
        assert_eq!(file.size().unwrap(), 17);
        assert_eq!(file.read(first).unwrap(), b"hello");
        assert_eq!(file.read(second).unwrap(), b"dash");
    }

    #[test]
    fn test_append_refuses_when_full() {
        let temp_dir = TempDir::new().unwrap();
        let file = RecordFile::create(temp_dir.path().join("f.dat"), 0, 16).unwrap();

        assert!(file.append(&[1u8; 8]).unwrap().is_some());
        assert!(file.append(&[2u8; 8]).unwrap().is_none());
        assert_eq!(file.size().unwrap(), 12);
    }

    #[test]
    fn test_read_outside_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let file = RecordFile::create(temp_dir.path().join("f.dat"), 0, 1024).unwrap();
        file.append(b"abc").unwrap();

        let result = file.read(RecordLocator {
            offset: 4,
            size: 100,
        });
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_truncate_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f.dat");
        {
            let file = RecordFile::create(path.clone(), 0, 1024).unwrap();
            file.append(b"complete").unwrap();
        }

        // Simulate a crash halfway through the next append.
        {
            let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(&100u32.to_le_bytes()).unwrap();
            raw.write_all(b"partial").unwrap();
        }

        let file = RecordFile::open(path, 0, 1024).unwrap();
        assert_eq!(file.truncate_torn_tail().unwrap(), 11);
        assert_eq!(file.size().unwrap(), 12);

        let next = file.append(b"next").unwrap().unwrap();
        assert_eq!(next.offset, 16);
        assert_eq!(file.read(next).unwrap(), b"next");
    }

    #[test]
    fn test_concurrent_readers() {
        let temp_dir = TempDir::new().unwrap();
        let file = RecordFile::create(temp_dir.path().join("f.dat"), 0, 1 << 20).unwrap();
        let locators: Vec<_> =
            (0..32u8).map(|i| file.append(&[i; 64]).unwrap().unwrap()).collect();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for (i, locator) in locators.iter().enumerate() {
                        assert_eq!(file.read(*locator).unwrap(), vec![i as u8; 64]);
                    }
                });
            }
            scope.spawn(|| {
                for i in 0..32u8 {
                    file.append(&[i; 16]).unwrap();
                }
            });
        });

        assert_eq!(file.size().unwrap(), 32 * 68 + 32 * 20);
    }
}
