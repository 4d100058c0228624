//! File-backed table using an append-only log.

use crate::error::{StoreError, StoreResult};
use crate::table::KeyValueTable;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 64 * 1024;
/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 256 * 1024 * 1024;

/// A persistent key/value table backed by an append-only log file.
///
/// Each `put` and `delete` appends a tagged, length-prefixed record and
/// flushes before returning, so an entry acknowledged to the caller
/// survives process termination. On open the log is replayed into an
/// in-memory index; a record cut short by a crash mid-write is dropped
/// and the file truncated back to the last complete record.
///
/// # Thread Safety
///
/// This table is thread-safe. A single mutex serializes writers; reads
/// are served from the in-memory index under the same lock.
///
/// # Example
///
/// ```no_run
/// use tidesync_store::{KeyValueTable, FileTable};
/// use std::path::Path;
///
/// let table = FileTable::open(Path::new("mutations.log")).unwrap();
/// table.put("m:0001", b"payload").unwrap();
/// ```
#[derive(Debug)]
pub struct FileTable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    index: BTreeMap<String, Vec<u8>>,
}

impl FileTable {
    /// Opens or creates a file table at the given path, replaying any
    /// existing log into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or if the log
    /// contains a structurally invalid record before its final entry.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (index, valid_len) = replay(&mut file)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            warn!(
                path = %path.display(),
                dropped = actual_len - valid_len,
                "dropping partial record at end of log"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(path = %path.display(), entries = index.len(), "opened file table");

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, index }),
        })
    }

    /// Opens or creates a file table, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file
    /// cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_record(inner: &mut Inner, tag: u8, key: &str, value: &[u8]) -> StoreResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }

        let mut buf = Vec::with_capacity(9 + key.len() + value.len());
        buf.push(tag);
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(value);

        inner.file.write_all(&buf)?;
        inner.file.flush()?;
        inner.file.sync_data()?;
        Ok(())
    }
}

/// Replays the log, returning the reconstructed index and the byte
/// offset of the end of the last complete record.
fn replay(file: &mut File) -> StoreResult<(BTreeMap<String, Vec<u8>>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut index = BTreeMap::new();
    let mut valid_len = 0u64;

    loop {
        let mut header = [0u8; 9];
        match read_exact_or_eof(&mut reader, &mut header)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial => break,
            ReadOutcome::Full => {}
        }

        let tag = header[0];
        let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if tag != TAG_PUT && tag != TAG_DELETE {
            return Err(StoreError::Corrupted(format!(
                "unknown record tag {tag} at offset {valid_len}"
            )));
        }
        if key_len > MAX_KEY_LEN || value_len > MAX_VALUE_LEN {
            return Err(StoreError::Corrupted(format!(
                "implausible record lengths at offset {valid_len}"
            )));
        }

        let mut key_bytes = vec![0u8; key_len];
        if !matches!(read_exact_or_eof(&mut reader, &mut key_bytes)?, ReadOutcome::Full) {
            break;
        }
        let mut value = vec![0u8; value_len];
        if !matches!(read_exact_or_eof(&mut reader, &mut value)?, ReadOutcome::Full) {
            break;
        }

        let key = String::from_utf8(key_bytes)
            .map_err(|_| StoreError::Corrupted(format!("non-UTF-8 key at offset {valid_len}")))?;

        match tag {
            TAG_PUT => {
                index.insert(key, value);
            }
            _ => {
                index.remove(&key);
            }
        }

        valid_len += 9 + key_len as u64 + value_len as u64;
    }

    Ok((index, valid_len))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> StoreResult<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

impl KeyValueTable for FileTable {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().index.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        Self::append_record(&mut inner, TAG_PUT, key, value)?;
        inner.index.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(key) {
            return Ok(());
        }
        Self::append_record(&mut inner, TAG_DELETE, key, &[])?;
        inner.index.remove(key);
        Ok(())
    }

    fn scan(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .index
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.sync_data()?;
        inner.index.clear();
        Ok(())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.inner.lock().index.len())
    }
}
