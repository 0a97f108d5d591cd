//! Append-only record storage spanning a directory of bounded, sequentially
//! numbered files.
//!
//! Files are named `<prefix><NNNNN>.dat` and must form the sequence `0..n`.
//! Only the last file is ever written to; once the store rotates past a file,
//! that file is immutable.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::record_file::{RecordFile, RecordReader, LENGTH_PREFIX_SIZE};
use super::types::FileRecordLocator;
use crate::error::{StorageError, StorageResult};

/// Extension of every record file.
const DATA_FILE_EXTENSION: &str = "dat";

/// Number of digits in a record file index.
const FILE_INDEX_DIGITS: usize = 5;

/// Durable, append-only byte storage addressed by [`FileRecordLocator`].
pub struct RecordStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    files: RwLock<Vec<Arc<RecordFile>>>,
}

impl RecordStore {
    /// Open the store in `dir`, creating the directory and file 0 if needed.
    ///
    /// Fails with [`StorageError::InvalidFileNumber`] when the existing files do
    /// not form a gap-free sequence starting at 0.
    pub fn open(dir: impl Into<PathBuf>, prefix: &str, max_file_size: u64) -> StorageResult<Self> {
        let dir = dir.into();
        if max_file_size <= LENGTH_PREFIX_SIZE {
            return Err(StorageError::InconsistentState(format!(
                "maximum file size {} cannot hold any record",
                max_file_size
            )));
        }

        fs::create_dir_all(&dir).map_err(|source| StorageError::FileIo {
            path: dir.clone(),
            source,
        })?;

        let mut indices = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(index) = name.to_str().and_then(|name| parse_file_index(name, prefix)) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        let file_count = indices.len() as u32;
        for (position, index) in indices.iter().enumerate() {
            if *index != position as u32 {
                return Err(StorageError::InvalidFileNumber {
                    file_index: *index,
                    file_count,
                });
            }
        }

        let mut files = Vec::with_capacity(indices.len().max(1));
        for index in indices {
            let path = file_path(&dir, prefix, index);
            files.push(Arc::new(RecordFile::open(path, index, max_file_size)?));
        }

        match files.last() {
            Some(last) => {
                last.truncate_torn_tail()?;
            }
            None => {
                let path = file_path(&dir, prefix, 0);
                files.push(Arc::new(RecordFile::create(path, 0, max_file_size)?));
            }
        }

        debug!("Opened record store {} with {} file(s)", dir.display(), files.len());

        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            max_file_size,
            files: RwLock::new(files),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Number of record files, including the one currently being appended to.
    pub fn file_count(&self) -> StorageResult<u32> {
        Ok(self.read_files()?.len() as u32)
    }

    /// Append position of the last file.
    pub fn last_file_size(&self) -> StorageResult<u64> {
        self.last_file()?.size()
    }

    /// Append `payload` to the last file, rotating to a new file first when it
    /// would not fit. A record never spans two files.
    pub fn append_record(&self, payload: &[u8]) -> StorageResult<FileRecordLocator> {
        let record_len = LENGTH_PREFIX_SIZE + payload.len() as u64;
        if record_len > self.max_file_size {
            return Err(StorageError::RecordTooLarge {
                size: payload.len() as u64,
                max_file_size: self.max_file_size,
            });
        }

        loop {
            let last = self.last_file()?;
            if let Some(locator) = last.append(payload)? {
                return Ok(FileRecordLocator {
                    file_index: last.index(),
                    locator,
                });
            }
            self.rotate(last.index())?;
        }
    }

    /// Read back the payload addressed by `locator`.
    pub fn read_record(&self, locator: &FileRecordLocator) -> StorageResult<Vec<u8>> {
        let file = {
            let files = self.read_files()?;
            files.get(locator.file_index as usize).cloned().ok_or(
                StorageError::InvalidFileNumber {
                    file_index: locator.file_index,
                    file_count: files.len() as u32,
                },
            )?
        };
        file.read(locator.locator)
    }

    /// fsync the last file. Earlier files were synced when the store rotated past them.
    pub fn flush(&self) -> StorageResult<()> {
        self.last_file()?.flush()
    }

    /// Iterate over every record in append order.
    ///
    /// The iterator sees the files as they were when it reached them; records
    /// appended concurrently to the last file may or may not be included.
    pub fn records(&self) -> StorageResult<Records> {
        Ok(Records {
            files: self.read_files()?.clone(),
            next_file: 0,
            current: None,
        })
    }

    /// Start a new last file unless another appender already did.
    fn rotate(&self, full_index: u32) -> StorageResult<()> {
        let mut files = self
            .files
            .write()
            .map_err(|_| StorageError::LockPoisoned("record store files".to_string()))?;

        let last = files.last().cloned().ok_or_else(|| {
            StorageError::InconsistentState("record store has no files".to_string())
        })?;
        if last.index() != full_index {
            return Ok(());
        }

        last.flush()?;
        let next_index = full_index + 1;
        let path = file_path(&self.dir, &self.prefix, next_index);
        files.push(Arc::new(RecordFile::create(path, next_index, self.max_file_size)?));

        info!(
            "Rotated record store {} to file {} ({} bytes in previous file)",
            self.dir.display(),
            next_index,
            last.size()?
        );
        Ok(())
    }

    fn last_file(&self) -> StorageResult<Arc<RecordFile>> {
        self.read_files()?.last().cloned().ok_or_else(|| {
            StorageError::InconsistentState("record store has no files".to_string())
        })
    }

    fn read_files(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Vec<Arc<RecordFile>>>> {
        self.files
            .read()
            .map_err(|_| StorageError::LockPoisoned("record store files".to_string()))
    }
}

/// Iterator over `(locator, payload)` pairs of a [`RecordStore`].
pub struct Records {
    files: Vec<Arc<RecordFile>>,
    next_file: usize,
    current: Option<(u32, RecordReader)>,
}

impl Iterator for Records {
    type Item = StorageResult<(FileRecordLocator, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((file_index, reader)) = self.current.as_mut() {
                match reader.next_record() {
                    Ok(Some((locator, payload))) => {
                        return Some(Ok((
                            FileRecordLocator {
                                file_index: *file_index,
                                locator,
                            },
                            payload,
                        )))
                    }
                    Ok(None) => self.current = None,
                    Err(e) => {
                        self.current = None;
                        self.next_file = self.files.len();
                        return Some(Err(e));
                    }
                }
            }

            let file = self.files.get(self.next_file)?.clone();
            self.next_file += 1;
            match file.reader() {
                Ok(reader) => self.current = Some((file.index(), reader)),
                Err(e) => {
                    self.next_file = self.files.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

fn file_path(dir: &Path, prefix: &str, index: u32) -> PathBuf {
    dir.join(file_name(prefix, index))
}

/// `<prefix><NNNNN>.dat`
pub fn file_name(prefix: &str, index: u32) -> String {
    format!("{}{:0width$}.{}", prefix, index, DATA_FILE_EXTENSION, width = FILE_INDEX_DIGITS)
}

/// Parse the index out of a record file name, ignoring unrelated files.
fn parse_file_index(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
    if digits.len() < FILE_INDEX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
