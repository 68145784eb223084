use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// The two directory-level locks a store directory carries: one writer, one
/// merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    Write,
    Merge,
}

impl LockKind {
    fn file_name(self) -> &'static str {
        match self {
            LockKind::Write => "bitcask.write.lock",
            LockKind::Merge => "bitcask.merge.lock",
        }
    }

    fn held_error(self, dir: &Path) -> Error {
        match self {
            LockKind::Write => Error::WriteLocked(dir.to_path_buf()),
            LockKind::Merge => Error::MergeLocked(dir.to_path_buf()),
        }
    }
}

/// A held directory lock.
///
/// The lock file body is `"<pid> <active_filename>\n"` and is guarded by an
/// OS advisory lock for as long as the holder lives. The file is removed
/// when the lock is dropped.
pub(crate) struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Take the `kind` lock on `dir`, failing if a live process holds it.
    ///
    /// A leftover lock file whose owner no longer holds the advisory lock
    /// is proof of a dead owner; the lock is reclaimed by rewriting it.
    pub fn acquire(kind: LockKind, dir: &Path) -> Result<LockFile> {
        let path = dir.join(kind.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(kind.held_error(dir));
        }
        debug!(lock = %path.display(), "acquired directory lock");

        let mut lock = LockFile { path, file };
        lock.update("")?;
        Ok(lock)
    }

    /// Record the active data file name in the lock body, so other openers
    /// can learn which file the holder is appending to.
    pub fn update(&mut self, active_file_name: &str) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        if active_file_name.is_empty() {
            writeln!(self.file, "{}", std::process::id())?;
        } else {
            writeln!(self.file, "{} {}", std::process::id(), active_file_name)?;
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Unlink before the handle closes, so the advisory lock is held for
        // as long as the file name is visible to other processes.
        let _ = fs::remove_file(&self.path);
    }
}

/// What a held lock file records.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LockInfo {
    pub owner_pid: u32,
    pub active_file: Option<String>,
}

/// Inspect the `kind` lock on `dir`.
///
/// Returns `None` when no lock file exists, and also when one exists but
/// its recorded owner is dead (the advisory lock died with it) — a stale
/// file must not make a reader exclude a data file nobody is appending to.
pub(crate) fn check(kind: LockKind, dir: &Path) -> Result<Option<LockInfo>> {
    let path = dir.join(kind.file_name());
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.try_lock_shared().is_ok() {
        debug!(lock = %path.display(), "ignoring stale lock file");
        return Ok(None);
    }

    let mut body = String::new();
    file.read_to_string(&mut body)?;
    let mut fields = body.split_whitespace();
    let owner_pid = fields
        .next()
        .and_then(|pid| pid.parse().ok())
        .ok_or_else(|| Error::Unexpected(format!("malformed lock file {}", path.display())))?;
    let active_file = fields.next().map(String::from);
    Ok(Some(LockInfo {
        owner_pid,
        active_file,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn locks_are_exclusive() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let lock = LockFile::acquire(LockKind::Write, temp_dir.path())?;

        assert!(matches!(
            LockFile::acquire(LockKind::Write, temp_dir.path()),
            Err(Error::WriteLocked(_))
        ));

        drop(lock);
        assert!(LockFile::acquire(LockKind::Write, temp_dir.path()).is_ok());
        Ok(())
    }

    #[test]
    fn write_and_merge_locks_are_independent() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let _write = LockFile::acquire(LockKind::Write, temp_dir.path())?;
        let merge = LockFile::acquire(LockKind::Merge, temp_dir.path());
        assert!(merge.is_ok());

        assert!(matches!(
            LockFile::acquire(LockKind::Merge, temp_dir.path()),
            Err(Error::MergeLocked(_))
        ));
        Ok(())
    }

    #[test]
    fn release_removes_the_file() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let path = temp_dir.path().join("bitcask.write.lock");

        let lock = LockFile::acquire(LockKind::Write, temp_dir.path())?;
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn check_reports_owner_and_active_file() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let mut lock = LockFile::acquire(LockKind::Write, temp_dir.path())?;

        let info = check(LockKind::Write, temp_dir.path())?.expect("lock is held");
        assert_eq!(info.owner_pid, std::process::id());
        assert_eq!(info.active_file, None);

        lock.update("17.bitcask.data")?;
        let info = check(LockKind::Write, temp_dir.path())?.expect("lock is held");
        assert_eq!(info.active_file, Some("17.bitcask.data".to_string()));

        assert_eq!(check(LockKind::Merge, temp_dir.path())?, None);
        Ok(())
    }

    #[test]
    fn stale_lock_is_ignored_and_reclaimed() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let path = temp_dir.path().join("bitcask.write.lock");
        fs::write(&path, "999999 17.bitcask.data\n")?;

        // Nobody holds the advisory lock, so the file is stale.
        assert_eq!(check(LockKind::Write, temp_dir.path())?, None);
        assert!(LockFile::acquire(LockKind::Write, temp_dir.path()).is_ok());
        Ok(())
    }
}
