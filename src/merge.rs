use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Options;
use crate::datafile::{self, ActiveFile, RECORD_HEADER_SIZE, TOMBSTONE};
use crate::error::Result;
use crate::keydir::{KeyDir, KeydirEntry};
use crate::lock::{LockFile, LockKind};
use crate::store::Bitcask;

/// Compacts the store at `dir` by rewriting the live records of its
/// immutable data files into fresh files, then deleting the originals.
///
/// Superseded versions and deleted keys are dropped, and each output file
/// gets a hint sidecar so the next open can rebuild its share of the keydir
/// without re-reading the values. The store is opened read-only for the
/// duration, so a concurrent writer keeps going and concurrent readers keep
/// being served; fails with [`Error::MergeLocked`](crate::Error::MergeLocked)
/// if another merge is already running.
pub fn merge(dir: impl AsRef<Path>) -> Result<()> {
    merge_with(dir.as_ref(), Options::default())
}

pub(crate) fn merge_with(dir: &Path, options: Options) -> Result<()> {
    let store = Bitcask::open(dir, options.read_write(false))?;
    let mut merge_lock = LockFile::acquire(LockKind::Merge, dir)?;

    let source_ids = store.read_file_ids();
    let Some(&newest_source) = source_ids.last() else {
        debug!(path = %dir.display(), "nothing to merge");
        return Ok(());
    };
    let keydir = store.keydir();

    // Output IDs sit above every source so that a rewritten record, which
    // keeps its timestamp, wins the keydir tie-break against its old copy.
    let mut output = ActiveFile::create(dir, newest_source + 1)?;
    merge_lock.update(&output.file_name())?;
    let mut hint_keydir = KeyDir::new();
    let del_keydir = KeyDir::new();
    let mut finished = Vec::<(u64, KeyDir)>::new();

    for &file_id in &source_ids {
        let mut reader = BufReader::new(
            OpenOptions::new()
                .read(true)
                .open(datafile::data_path(dir, file_id))?,
        );
        let file_len = reader.get_ref().metadata()?.len();
        let mut pos = 0;
        while let Some(record) = datafile::read_next_record(&mut reader, pos, file_len)? {
            pos += record.total_size;
            let seen = KeydirEntry {
                file_id,
                total_size: record.total_size,
                value_offset: record.value_offset,
                tstamp: record.tstamp,
                tombstone: record.value == TOMBSTONE,
            };

            // A record is out of date if the live index, the current
            // output's hints, or a pending delete already carries something
            // more recent for its key.
            let out_of_date = [keydir, &hint_keydir, &del_keydir].iter().any(|kd| {
                kd.get(&record.key)
                    .is_some_and(|existing| existing != seen && existing.supersedes(&seen))
            });
            if out_of_date {
                continue;
            }

            if record.value == TOMBSTONE {
                // Remember the deletion so older live copies are dropped,
                // but never write it out: once the sources are gone the
                // tombstone has nothing left to shadow.
                del_keydir.put(record.key, seen);
                continue;
            }
            del_keydir.remove(&record.key);

            if output.would_wrap(&record.key, &record.value, options.max_file_size) {
                output.sync()?;
                let finished_id = output.file_id();
                finished.push((finished_id, std::mem::replace(&mut hint_keydir, KeyDir::new())));
                output = ActiveFile::create(dir, finished_id + 1)?;
                merge_lock.update(&output.file_name())?;
                debug!(file_id = output.file_id(), "rotated merge output file");
            }

            let (value_offset, total_size) =
                output.append(&record.key, &record.value, record.tstamp)?;
            let rewritten = KeydirEntry {
                file_id: output.file_id(),
                total_size,
                value_offset,
                tstamp: record.tstamp,
                tombstone: false,
            };
            // Repoint the live index as we go so concurrent readers follow
            // the data to its new home.
            keydir.put(record.key.clone(), rewritten);
            hint_keydir.put(record.key, rewritten);
        }
    }

    output.sync()?;
    let final_id = output.file_id();
    if output.pos() > 0 {
        finished.push((final_id, hint_keydir));
    } else {
        // Everything was dead; no point keeping an empty output around.
        drop(output);
        fs::remove_file(datafile::data_path(dir, final_id))?;
    }

    // The live contents are safely rewritten; retire the sources and their
    // old hints.
    for &file_id in &source_ids {
        fs::remove_file(datafile::data_path(dir, file_id))?;
        if let Err(e) = fs::remove_file(datafile::hint_path(dir, file_id)) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }

    drop(merge_lock);

    // Hint emission is best-effort: losing one only costs the next open a
    // full scan of that file.
    for (file_id, hints) in &finished {
        if let Err(e) = write_hint_file(dir, *file_id, hints) {
            warn!(file_id, error = %e, "failed to write hint file");
        }
    }

    info!(
        path = %dir.display(),
        sources = source_ids.len(),
        outputs = finished.len(),
        "merge complete"
    );
    Ok(())
}

/// Serialise a merge output's hint keydir into its sidecar, going through a
/// transient `.merging` name so a finished hint file is always complete.
fn write_hint_file(dir: &Path, file_id: u64, hints: &KeyDir) -> Result<()> {
    let merging_path = datafile::merging_hint_path(dir, file_id);
    let mut writer = BufWriter::new(
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&merging_path)?,
    );
    for (key, entry) in hints.entries() {
        let value_len = (entry.total_size - RECORD_HEADER_SIZE - key.len() as u64) as u32;
        datafile::write_hint(&mut writer, &key, entry.tstamp, value_len, entry.value_offset)?;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;
    drop(writer);
    fs::rename(&merging_path, datafile::hint_path(dir, file_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn data_files(path: &Path) -> Vec<std::path::PathBuf> {
        let mut files: Vec<std::path::PathBuf> = fs::read_dir(path)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(datafile::parse_data_file_id)
                    .is_some()
            })
            .collect();
        files.sort();
        files
    }

    fn hint_files(path: &Path) -> Vec<std::path::PathBuf> {
        fs::read_dir(path)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(datafile::parse_hint_file_id)
                    .is_some()
            })
            .collect()
    }

    #[test]
    fn merge_compacts_to_a_single_file() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .max_file_size(1)
            .open(temp_dir.path())?;
        store.put(b"key1", b"value1")?;
        store.put(b"key2", b"value2")?;
        store.put(b"key3", b"value3")?;
        store.close()?;
        assert_eq!(data_files(temp_dir.path()).len(), 4);

        merge(temp_dir.path())?;

        assert_eq!(data_files(temp_dir.path()).len(), 1);
        assert_eq!(hint_files(temp_dir.path()).len(), 1);

        // The hint file feeds the reopen; every key must still be there.
        let store = Options::default().open(temp_dir.path())?;
        assert_eq!(store.get(b"key1")?, Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2")?, Some(b"value2".to_vec()));
        assert_eq!(store.get(b"key3")?, Some(b"value3".to_vec()));
        Ok(())
    }

    #[test]
    fn merge_drops_deleted_keys() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .open(temp_dir.path())?;
        store.put(b"doomed-key", b"doomed-value")?;
        store.put(b"kept-key", b"kept-value")?;
        store.delete(b"doomed-key")?;
        store.close()?;

        merge(temp_dir.path())?;

        let store = Options::default().open(temp_dir.path())?;
        assert_eq!(store.get(b"doomed-key")?, None);
        assert_eq!(store.get(b"kept-key")?, Some(b"kept-value".to_vec()));

        // Neither the key, its value, nor its tombstone survives on disk.
        for file in data_files(temp_dir.path()) {
            let bytes = fs::read(&file)?;
            assert!(!bytes
                .windows(b"doomed-key".len())
                .any(|w| w == b"doomed-key"));
        }
        Ok(())
    }

    #[test]
    fn merge_of_a_fully_deleted_store_leaves_no_data_files() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .open(temp_dir.path())?;
        store.put(b"key1", b"value1")?;
        store.delete(b"key1")?;
        store.close()?;

        merge(temp_dir.path())?;

        assert!(data_files(temp_dir.path()).is_empty());
        let store = Options::default().open(temp_dir.path())?;
        assert_eq!(store.get(b"key1")?, None);
        Ok(())
    }

    // Insert overwritten and deleted data, merge, and check that the visible
    // state is unchanged while the directory shrinks.
    #[test]
    fn merge_preserves_visible_state() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .max_file_size(1024)
            .open(temp_dir.path())?;

        let dir_size = || {
            let entries = WalkDir::new(temp_dir.path()).into_iter();
            let len: walkdir::Result<u64> = entries
                .map(|res| {
                    res.and_then(|entry| entry.metadata())
                        .map(|metadata| metadata.len())
                })
                .sum();
            len.expect("fail to get directory size")
        };

        let mut expected = HashMap::new();
        for iter in 0..10 {
            for key_id in 0..50 {
                let key = format!("key{}", key_id);
                let value = format!("value{}-{}", key_id, iter);
                store.put(key.as_bytes(), value.as_bytes())?;
                expected.insert(key, value);
            }
        }
        for key_id in 0..10 {
            let key = format!("key{}", key_id);
            store.delete(key.as_bytes())?;
            expected.remove(&key);
        }
        store.close()?;

        let size_before = dir_size();
        let files_before = data_files(temp_dir.path()).len();

        merge(temp_dir.path())?;

        assert!(
            dir_size() < size_before,
            "expected dir size to shrink after merge"
        );
        assert!(data_files(temp_dir.path()).len() <= files_before);

        let store = Options::default().open(temp_dir.path())?;
        for key_id in 0..50 {
            let key = format!("key{}", key_id);
            assert_eq!(
                store.get(key.as_bytes())?,
                expected.get(&key).map(|v| v.clone().into_bytes()),
                "mismatch for {}",
                key
            );
        }
        Ok(())
    }

    #[test]
    fn merge_is_locked_out_while_another_runs() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let held = LockFile::acquire(LockKind::Merge, temp_dir.path())?;

        assert!(matches!(
            merge(temp_dir.path()),
            Err(Error::MergeLocked(_))
        ));

        drop(held);
        assert!(merge(temp_dir.path()).is_ok());
        Ok(())
    }

    #[test]
    fn merge_of_an_empty_store_is_ok() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        merge(temp_dir.path())?;
        assert!(data_files(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn merge_rotates_outputs_at_the_size_limit() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .max_file_size(1)
            .open(temp_dir.path())?;
        store.put(b"key1", b"value1")?;
        store.put(b"key2", b"value2")?;
        store.put(b"key3", b"value3")?;
        store.close()?;

        merge_with(temp_dir.path(), Options::default().max_file_size(1))?;

        assert_eq!(data_files(temp_dir.path()).len(), 3);
        assert_eq!(hint_files(temp_dir.path()).len(), 3);

        let store = Options::default().open(temp_dir.path())?;
        assert_eq!(store.get(b"key1")?, Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2")?, Some(b"value2".to_vec()));
        assert_eq!(store.get(b"key3")?, Some(b"value3".to_vec()));
        Ok(())
    }

    // Read handles opened before a merge keep working: the sources are
    // immutable and stay readable through the open descriptors even after
    // they are unlinked.
    #[test]
    fn open_readers_survive_a_merge() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .open(temp_dir.path())?;
        store.put(b"key1", b"value1")?;
        store.close()?;

        let reader_store = Options::default().open(temp_dir.path())?;
        merge(temp_dir.path())?;
        assert_eq!(reader_store.get(b"key1")?, Some(b"value1".to_vec()));
        Ok(())
    }

    #[test]
    fn store_keeps_working_after_a_merge() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let store = Options::default()
            .read_write(true)
            .max_file_size(1)
            .open(temp_dir.path())?;
        store.put(b"key1", b"value1")?;
        store.put(b"key2", b"value2")?;
        store.close()?;

        merge(temp_dir.path())?;

        let store = Options::default()
            .read_write(true)
            .open(temp_dir.path())?;
        store.put(b"key3", b"value3")?;
        store.put(b"key1", b"value1-new")?;
        store.close()?;

        let store = Options::default().open(temp_dir.path())?;
        assert_eq!(store.get(b"key1")?, Some(b"value1-new".to_vec()));
        assert_eq!(store.get(b"key2")?, Some(b"value2".to_vec()));
        assert_eq!(store.get(b"key3")?, Some(b"value3".to_vec()));
        Ok(())
    }
}
