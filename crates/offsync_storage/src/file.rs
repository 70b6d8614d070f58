//! File-backed key-value store.
//!
//! The file is an append-only log of framed entries:
//!
//! ```text
//! file   := magic "OSKV" | version u16 LE | frame*
//! frame  := tag u8 | key_len u32 LE | value_len u32 LE | key | value | crc32 u32 LE
//! ```
//!
//! The CRC covers everything in the frame before it. Replaying the log on
//! open rebuilds the in-memory index; the last frame for a key wins and a
//! delete frame removes the key.

use crate::checksum::Crc32;
use crate::error::{StorageError, StorageResult};
use crate::store::PersistentStore;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Magic bytes identifying a store file.
const FILE_MAGIC: [u8; 4] = *b"OSKV";

/// Current store file format version.
const FILE_VERSION: u16 = 1;

/// magic (4) + version (2)
const FILE_HEADER_SIZE: u64 = 6;

/// tag (1) + key_len (4) + value_len (4)
const FRAME_HEADER_SIZE: usize = 9;

const CRC_SIZE: usize = 4;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

/// Options for [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Call `sync_data` after every write. Durability requires this.
    pub sync_on_write: bool,
    /// Fraction of dead bytes that triggers automatic compaction.
    pub compact_threshold: f64,
    /// Files smaller than this are never compacted automatically.
    pub min_compact_bytes: u64,
}

impl FileStoreOptions {
    /// Sets whether writes are synced to disk before returning.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the dead-byte ratio that triggers compaction.
    pub fn with_compact_threshold(mut self, threshold: f64) -> Self {
        self.compact_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Sets the minimum file size for automatic compaction.
    pub fn with_min_compact_bytes(mut self, bytes: u64) -> Self {
        self.min_compact_bytes = bytes;
        self
    }
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_threshold: 0.5,
            min_compact_bytes: 64 * 1024,
        }
    }
}

/// Size information about a [`FileStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStoreStats {
    /// Current file size in bytes.
    pub file_bytes: u64,
    /// Bytes taken by frames that are still live.
    pub live_bytes: u64,
    /// Number of live keys.
    pub keys: usize,
}

struct Inner {
    file: File,
    size: u64,
    index: BTreeMap<String, Vec<u8>>,
    live_bytes: u64,
}

/// A durable key-value store backed by a single append-only file.
///
/// All keys and values are held in memory; the file is only read on open.
///
/// # Durability
///
/// - With `sync_on_write` (the default) every `put`/`delete` calls
///   `File::sync_data()` before returning
/// - A frame torn by a crash mid-append is truncated away on the next open
/// - A checksum mismatch anywhere but the tail is reported as corruption
///
/// # Example
///
/// ```no_run
/// use offsync_storage::{FileStore, PersistentStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("offsync.kv")).unwrap();
/// store.put("log/meta/next_op_id", &7u64.to_le_bytes()).unwrap();
/// ```
pub struct FileStore {
    path: PathBuf,
    options: FileStoreOptions,
    inner: Mutex<Inner>,
    // Held for the lifetime of the store; the lock is released on drop.
    _lock_file: File,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Opens or creates a store at the given path with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is corrupted.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_options(path, FileStoreOptions::default())
    }

    /// Opens or creates a store, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Opens or creates a store with explicit options.
    ///
    /// Takes an exclusive lock on `<path>.lock`, so only one process at a
    /// time can open the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the store, or
    /// an error if the file cannot be opened or is corrupted.
    pub fn open_with_options(path: &Path, options: FileStoreOptions) -> StorageResult<Self> {
        let lock_path = lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let (index, live_bytes, size) = if len == 0 {
            file.write_all(&file_header())?;
            file.sync_all()?;
            (BTreeMap::new(), 0, FILE_HEADER_SIZE)
        } else {
            let mut bytes = Vec::with_capacity(len as usize);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut bytes)?;

            let replay = replay(&bytes)?;
            if replay.valid_end < len {
                tracing::warn!(
                    path = %path.display(),
                    valid_end = replay.valid_end,
                    file_len = len,
                    "truncating torn tail of store file"
                );
                file.set_len(replay.valid_end)?;
                file.sync_all()?;
            }
            (replay.index, replay.live_bytes, replay.valid_end)
        };

        Ok(Self {
            path: path.to_path_buf(),
            options,
            inner: Mutex::new(Inner {
                file,
                size,
                index,
                live_bytes,
            }),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns size information about the store.
    #[must_use]
    pub fn stats(&self) -> FileStoreStats {
        let inner = self.inner.lock();
        FileStoreStats {
            file_bytes: inner.size,
            live_bytes: inner.live_bytes,
            keys: inner.index.len(),
        }
    }

    /// Rewrites the file so it holds only live entries.
    ///
    /// The new file is written next to the old one and renamed over it, so a
    /// crash during compaction leaves the original intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the new file cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> StorageResult<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut buf = file_header().to_vec();
        for (key, value) in &inner.index {
            buf.extend_from_slice(&encode_frame(TAG_PUT, key, value));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        // The handle follows the file through the rename.
        fs::rename(&tmp_path, &self.path)?;

        let before = inner.size;
        inner.file = file;
        inner.size = buf.len() as u64;
        inner.live_bytes = inner.size - FILE_HEADER_SIZE;

        tracing::debug!(
            path = %self.path.display(),
            before,
            after = inner.size,
            "compacted store file"
        );
        Ok(())
    }

    fn append_locked(&self, inner: &mut Inner, frame: &[u8]) -> StorageResult<()> {
        let start = inner.size;
        if let Err(err) = write_frame(&mut inner.file, frame, self.options.sync_on_write) {
            // Drop whatever part of the frame reached the file
            let _ = inner.file.set_len(start);
            return Err(err.into());
        }

        inner.size += frame.len() as u64;
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut Inner) {
        if inner.size < self.options.min_compact_bytes {
            return;
        }
        let dead = inner.size - FILE_HEADER_SIZE - inner.live_bytes;
        if dead as f64 / inner.size as f64 >= self.options.compact_threshold {
            // The write that got us here is already durable.
            if let Err(e) = self.compact_locked(inner) {
                tracing::warn!(path = %self.path.display(), error = %e, "store compaction failed");
            }
        }
    }
}

/// Path of the lock file guarding the store at `path`.
fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().index.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(TAG_PUT, key, value);
        let mut inner = self.inner.lock();
        self.append_locked(&mut inner, &frame)?;

        if let Some(old) = inner.index.insert(key.to_string(), value.to_vec()) {
            inner.live_bytes -= frame_len(key.len(), old.len());
        }
        inner.live_bytes += frame.len() as u64;

        self.maybe_compact(&mut inner);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(key) {
            return Ok(());
        }

        let frame = encode_frame(TAG_DELETE, key, &[]);
        self.append_locked(&mut inner, &frame)?;

        if let Some(old) = inner.index.remove(key) {
            inner.live_bytes -= frame_len(key.len(), old.len());
        }

        self.maybe_compact(&mut inner);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }
}

fn write_frame(file: &mut File, frame: &[u8], sync: bool) -> std::io::Result<()> {
    file.seek(SeekFrom::End(0))?;
    file.write_all(frame)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn file_header() -> [u8; FILE_HEADER_SIZE as usize] {
    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&FILE_MAGIC);
    header[4..].copy_from_slice(&FILE_VERSION.to_le_bytes());
    header
}

fn frame_len(key_len: usize, value_len: usize) -> u64 {
    (FRAME_HEADER_SIZE + key_len + value_len + CRC_SIZE) as u64
}

fn encode_frame(tag: u8, key: &str, value: &[u8]) -> Vec<u8> {
    let key = key.as_bytes();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + key.len() + value.len() + CRC_SIZE);
    frame.push(tag);
    frame.extend_from_slice(&(key.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);

    let mut crc = Crc32::new();
    crc.update(&frame);
    frame.extend_from_slice(&crc.finish().to_le_bytes());
    frame
}

struct Replay {
    index: BTreeMap<String, Vec<u8>>,
    live_bytes: u64,
    valid_end: u64,
}

fn replay(bytes: &[u8]) -> StorageResult<Replay> {
    let header = FILE_HEADER_SIZE as usize;
    if bytes.len() < header {
        return Err(StorageError::corrupted(0, "file shorter than header"));
    }
    if bytes[..4] != FILE_MAGIC {
        return Err(StorageError::corrupted(0, "bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FILE_VERSION {
        return Err(StorageError::corrupted(
            4,
            format!("unsupported format version {version}"),
        ));
    }

    let mut index = BTreeMap::new();
    let mut live_bytes = 0u64;
    let mut offset = header;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_HEADER_SIZE {
            break;
        }

        let tag = rest[0];
        let key_len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let value_len = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]) as usize;
        let total = FRAME_HEADER_SIZE
            .saturating_add(key_len)
            .saturating_add(value_len)
            .saturating_add(CRC_SIZE);
        if rest.len() < total {
            break;
        }

        let body_end = total - CRC_SIZE;
        let stored_crc = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let mut crc = Crc32::new();
        crc.update(&rest[..body_end]);
        if crc.finish() != stored_crc {
            if offset + total == bytes.len() {
                // Last frame only partially hit the disk
                break;
            }
            return Err(StorageError::corrupted(offset as u64, "checksum mismatch"));
        }

        let key_start = FRAME_HEADER_SIZE;
        let value_start = key_start + key_len;
        let key = std::str::from_utf8(&rest[key_start..value_start])
            .map_err(|_| StorageError::corrupted(offset as u64, "key is not UTF-8"))?
            .to_string();

        match tag {
            TAG_PUT => {
                let value = rest[value_start..body_end].to_vec();
                if let Some(old) = index.insert(key, value) {
                    live_bytes -= frame_len(key_len, old.len());
                }
                live_bytes += total as u64;
            }
            TAG_DELETE => {
                if let Some(old) = index.remove(&key) {
                    live_bytes -= frame_len(key_len, old.len());
                }
            }
            other => {
                return Err(StorageError::corrupted(
                    offset as u64,
                    format!("unknown frame tag {other}"),
                ));
            }
        }

        offset += total;
    }

    Ok(Replay {
        index,
        live_bytes,
        valid_end: offset as u64,
    })
}
