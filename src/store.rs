use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::datafile::{self, ActiveFile, Record, RECORD_HEADER_SIZE, TOMBSTONE};
use crate::error::{Error, Result};
use crate::keydir::{KeyDir, KeydirEntry};
use crate::lock::{self, LockFile, LockKind};

/// `Bitcask` stores opaque byte-string values under opaque byte-string keys
/// inside a single directory, using the append-only log layout of the
/// [Bitcask Paper](https://riak.com/assets/bitcask-intro.pdf): all writes go
/// to one active data file, and an in-memory keydir maps every key to the
/// location of its most recent value, so a `get` costs at most one seek.
///
/// `Bitcask` is thread-safe and can be cloned and shared between threads;
/// clones share the keydir and the writer, while each keeps its own cache of
/// read handles.
///
/// Example:
///
/// ```rust
/// # use caskdb::{Bitcask, Options};
/// let dir = tempfile::tempdir().unwrap();
/// let store = Options::default().read_write(true).open(dir.path()).unwrap();
/// store.put(b"key", b"value").unwrap();
/// let val = store.get(b"key").unwrap();
/// assert_eq!(val, Some(b"value".to_vec()));
/// ```
#[derive(Clone)]
pub struct Bitcask {
    path: Arc<PathBuf>,
    keydir: Arc<KeyDir>,
    writer: Option<Arc<Mutex<Writer>>>,
    reader: Reader,
    read_file_ids: Arc<Vec<u64>>,
}

impl Bitcask {
    /// Opens the store at a given directory, creating it if needed.
    ///
    /// With `Options::read_write` the directory's write lock is taken (or
    /// the open fails with [`Error::WriteLocked`]) and a fresh active data
    /// file is created for appends. A read-only open takes no lock; it
    /// consults the write lock, if a live writer holds one, only to learn
    /// which file is being appended to so that file can be left alone.
    ///
    /// All other data files are scanned newest-first to rebuild the keydir,
    /// reading a hint file instead of the data file wherever one exists. A
    /// truncated trailing record — the footprint of a crashed writer — ends
    /// a file's scan cleanly; interior corruption fails the open.
    pub fn open(path: impl Into<PathBuf>, options: Options) -> Result<Bitcask> {
        options.validate()?;
        let path: PathBuf = path.into();
        fs::create_dir_all(&path)?;

        let mut data_file_ids = Vec::<u64>::new();
        let mut hint_file_ids = HashSet::<u64>::new();
        let mut stale_merging_hints = Vec::<PathBuf>::new();
        for entry in fs::read_dir(&path)? {
            let file_path = entry?.path();
            let Some(file_name) = file_path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if let Some(file_id) = datafile::parse_data_file_id(file_name) {
                data_file_ids.push(file_id);
            } else if let Some(file_id) = datafile::parse_hint_file_id(file_name) {
                hint_file_ids.insert(file_id);
            } else if datafile::is_merging_hint(file_name) {
                stale_merging_hints.push(file_path);
            }
        }

        // In read-write mode this store owns the active file and everything
        // found on disk belongs to the read set. In read-only mode a live
        // writer may own one of the enumerated files; it is excluded because
        // only its owner knows how much of it is valid.
        let (writer, active_file_id) = if options.read_write {
            let mut write_lock = LockFile::acquire(LockKind::Write, &path)?;
            if lock::check(LockKind::Merge, &path)?.is_none() {
                for stale in &stale_merging_hints {
                    warn!(file = %stale.display(), "removing leftover hint file from an interrupted merge");
                    let _ = fs::remove_file(stale);
                }
            }
            let floor = data_file_ids.iter().max().map_or(0, |max_id| max_id + 1);
            let active = ActiveFile::create(&path, floor)?;
            write_lock.update(&active.file_name())?;
            let active_file_id = active.file_id();
            (Some((write_lock, active)), Some(active_file_id))
        } else {
            let active_file_id = match lock::check(LockKind::Write, &path)? {
                Some(info) => {
                    debug!(
                        owner = info.owner_pid,
                        active = ?info.active_file,
                        "live writer present, leaving its active file alone"
                    );
                    info.active_file
                        .and_then(|name| datafile::parse_data_file_id(&name))
                }
                None => None,
            };
            (None, active_file_id)
        };
        if let Some(active_file_id) = active_file_id {
            data_file_ids.retain(|file_id| *file_id != active_file_id);
        }

        // Newest first. The keydir's install rule resolves duplicates in any
        // scan order, so this only front-loads the entries that survive.
        data_file_ids.sort_unstable_by(|a, b| b.cmp(a));

        let keydir = KeyDir::new();
        let mut readers = HashMap::<u64, BufReader<File>>::new();
        let mut max_tstamp = 0;
        for &file_id in &data_file_ids {
            let mut reader = BufReader::new(
                OpenOptions::new()
                    .read(true)
                    .open(datafile::data_path(&path, file_id))?,
            );
            let entries = if hint_file_ids.contains(&file_id) {
                scan_hint_file(&path, file_id, &keydir, &mut max_tstamp)?
            } else {
                scan_data_file(&mut reader, file_id, &keydir, &mut max_tstamp)?
            };
            debug!(file_id, entries, "scanned data file");
            readers.insert(file_id, reader);
        }
        info!(
            path = %path.display(),
            keys = keydir.len(),
            files = data_file_ids.len(),
            "opened store"
        );

        let path = Arc::new(path);
        let writer = writer.map(|(lock, active)| {
            Arc::new(Mutex::new(Writer {
                path: path.clone(),
                active,
                lock,
                max_file_size: options.max_file_size,
                sync_on_put: options.sync_on_put,
                last_tstamp: max_tstamp,
            }))
        });

        Ok(Bitcask {
            path: path.clone(),
            keydir: Arc::new(keydir),
            writer,
            reader: Reader {
                path,
                readers: RefCell::new(readers),
            },
            read_file_ids: Arc::new(data_file_ids),
        })
    }

    /// Gets the value stored under a key.
    ///
    /// Returns `None` if the key does not exist or was deleted. The whole
    /// record is re-read and checksummed, so a damaged record surfaces as
    /// [`Error::Corruption`] rather than a wrong answer.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.keydir.get(key) else {
            return Ok(None);
        };
        let record = self.reader.read_record(key, &entry)?;
        if record.value == TOMBSTONE {
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    /// Stores a value under a key, overwriting any previous value.
    ///
    /// Fails with [`Error::ReadOnly`] unless the store was opened with
    /// `Options::read_write`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        if value == TOMBSTONE {
            return Err(Error::InvalidArgument(
                "value is the reserved tombstone sentinel".to_string(),
            ));
        }
        if value.len() as u64 > u32::MAX as u64 {
            return Err(Error::InvalidArgument(
                "value is longer than 2^32 - 1 bytes".to_string(),
            ));
        }
        self.append_record(key, value)
    }

    /// Removes a key by writing a tombstone; the space is reclaimed by the
    /// next [`merge`](crate::merge()). Removing an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.append_record(key, TOMBSTONE)
    }

    /// Lists all keys that currently hold a value.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keydir
            .entries()
            .filter(|(_, entry)| !entry.tombstone)
            .map(|(key, _)| key)
            .collect()
    }

    /// Forces everything appended so far onto disk.
    pub fn sync(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.lock().expect(WRITER_LOCK_POISONED).active.sync(),
            None => Ok(()),
        }
    }

    /// Flushes and closes the store.
    ///
    /// The write lock, if this handle owns one, is released once the last
    /// clone of the handle is gone.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    fn append_record(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(Error::ReadOnly)?;
        let mut writer = writer.lock().expect(WRITER_LOCK_POISONED);

        let tstamp = writer.next_tstamp()?;
        let (value_offset, total_size) = writer.active.append(key, value, tstamp)?;
        if writer.sync_on_put {
            writer.active.sync()?;
        }
        self.keydir.put(
            key.to_vec(),
            KeydirEntry {
                file_id: writer.active.file_id(),
                total_size,
                value_offset,
                tstamp,
                tombstone: value == TOMBSTONE,
            },
        );

        // Rotate once the active file outgrows the limit, keeping the
        // retired handle open for reads.
        if writer.active.pos() > writer.max_file_size {
            let (retired_id, retired_file) = writer.rotate()?;
            self.reader.cache(retired_id, retired_file);
        }
        Ok(())
    }

    pub(crate) fn keydir(&self) -> &KeyDir {
        &self.keydir
    }

    /// IDs of the immutable files serving reads, oldest first.
    pub(crate) fn read_file_ids(&self) -> Vec<u64> {
        let mut file_ids = self.read_file_ids.as_ref().clone();
        file_ids.sort_unstable();
        file_ids
    }
}

const WRITER_LOCK_POISONED: &str = "another thread panicked while holding the writer lock";

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    if key.len() as u64 > u32::MAX as u64 {
        return Err(Error::InvalidArgument(
            "key is longer than 2^32 - 1 bytes".to_string(),
        ));
    }
    Ok(())
}

struct Writer {
    path: Arc<PathBuf>,
    active: ActiveFile,
    lock: LockFile,
    max_file_size: u64,
    sync_on_put: bool,
    last_tstamp: u32,
}

impl Writer {
    /// Next record timestamp: the wall clock, never running backwards past
    /// anything this store has already stamped or indexed.
    fn next_tstamp(&mut self) -> Result<u32> {
        self.last_tstamp = self.last_tstamp.max(datafile::timestamp_now()?);
        Ok(self.last_tstamp)
    }

    /// Retire the active file into the read set and start a fresh one.
    fn rotate(&mut self) -> Result<(u64, File)> {
        self.active.sync()?;
        let fresh = ActiveFile::create(&self.path, self.active.file_id() + 1)?;
        let retired = std::mem::replace(&mut self.active, fresh);
        self.lock.update(&self.active.file_name())?;
        debug!(
            from = retired.file_id(),
            to = self.active.file_id(),
            "rotated active data file"
        );
        retired.into_read_file()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.active.sync() {
            error!(error = %e, "failed to sync active data file on close");
        }
    }
}

struct Reader {
    path: Arc<PathBuf>,
    readers: RefCell<HashMap<u64, BufReader<File>>>,
}

impl Reader {
    /// Re-read the whole record behind a keydir entry, opening a read handle
    /// for its file on first use.
    fn read_record(&self, key: &[u8], entry: &KeydirEntry) -> Result<Record> {
        let mut readers = self.readers.borrow_mut();
        if let Some(reader) = readers.get_mut(&entry.file_id) {
            return read_indexed_record(reader, key, entry);
        }
        let mut reader = BufReader::new(
            OpenOptions::new()
                .read(true)
                .open(datafile::data_path(&self.path, entry.file_id))?,
        );
        let record = read_indexed_record(&mut reader, key, entry)?;
        readers.insert(entry.file_id, reader);
        Ok(record)
    }

    fn cache(&self, file_id: u64, file: File) {
        self.readers
            .borrow_mut()
            .insert(file_id, BufReader::new(file));
    }
}

impl Clone for Reader {
    fn clone(&self) -> Self {
        Reader {
            path: self.path.clone(),
            readers: RefCell::new(HashMap::new()),
        }
    }
}

fn read_indexed_record(
    reader: &mut BufReader<File>,
    key: &[u8],
    entry: &KeydirEntry,
) -> Result<Record> {
    let record_offset = entry
        .value_offset
        .checked_sub(RECORD_HEADER_SIZE + key.len() as u64)
        .ok_or_else(|| {
            Error::Unexpected(format!(
                "indexed value offset {} sits inside the record frame",
                entry.value_offset
            ))
        })?;
    let record = datafile::read_record_at(reader, record_offset, entry.total_size)?;
    if record.key != key {
        return Err(Error::Unexpected(
            "indexed record holds a different key".to_string(),
        ));
    }
    Ok(record)
}

fn scan_data_file(
    reader: &mut BufReader<File>,
    file_id: u64,
    keydir: &KeyDir,
    max_tstamp: &mut u32,
) -> Result<usize> {
    let file_len = reader.get_ref().metadata()?.len();
    let mut pos = 0;
    let mut entries = 0;
    while let Some(record) = datafile::read_next_record(reader, pos, file_len)? {
        pos += record.total_size;
        entries += 1;
        *max_tstamp = (*max_tstamp).max(record.tstamp);
        keydir.put(
            record.key,
            KeydirEntry {
                file_id,
                total_size: record.total_size,
                value_offset: record.value_offset,
                tstamp: record.tstamp,
                tombstone: record.value == TOMBSTONE,
            },
        );
    }
    Ok(entries)
}

/// Rebuild a data file's share of the keydir from its hint sidecar, which
/// carries everything needed without re-reading the values.
fn scan_hint_file(
    dir: &Path,
    file_id: u64,
    keydir: &KeyDir,
    max_tstamp: &mut u32,
) -> Result<usize> {
    let mut reader = BufReader::new(
        OpenOptions::new()
            .read(true)
            .open(datafile::hint_path(dir, file_id))?,
    );
    let file_len = reader.get_ref().metadata()?.len();
    let mut pos = 0;
    let mut entries = 0;
    while let Some(hint) = datafile::read_next_hint(&mut reader, pos, file_len)? {
        pos += datafile::HINT_HEADER_SIZE + hint.key.len() as u64;
        entries += 1;
        *max_tstamp = (*max_tstamp).max(hint.tstamp);
        let total_size = RECORD_HEADER_SIZE + hint.key.len() as u64 + hint.value_len;
        keydir.put(
            hint.key,
            KeydirEntry {
                file_id,
                total_size,
                value_offset: hint.value_offset,
                tstamp: hint.tstamp,
                // Hint files describe merge output, which holds live values only.
                tombstone: false,
            },
        );
    }
    Ok(entries)
}
