use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::store::Bitcask;

/// Default maximum size of a data file before the writer rotates to a fresh
/// one: 2 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Options used when opening a store.
///
/// ```rust
/// # use caskdb::Options;
/// let dir = tempfile::tempdir().unwrap();
/// let store = Options::default()
///     .read_write(true)
///     .max_file_size(64 * 1024 * 1024)
///     .open(dir.path())
///     .unwrap();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub(crate) read_write: bool,
    pub(crate) max_file_size: u64,
    pub(crate) sync_on_put: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_write: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            sync_on_put: false,
        }
    }
}

impl Options {
    /// Open the store at the given directory with these options.
    pub fn open(self, path: impl Into<PathBuf>) -> Result<Bitcask> {
        Bitcask::open(path, self)
    }

    /// Open the store for writing as well as reading. Default: `false`.
    ///
    /// A read-write open takes the directory's write lock and fails with
    /// [`Error::WriteLocked`] if another live process already holds it.
    pub fn read_write(mut self, read_write: bool) -> Options {
        self.read_write = read_write;
        self
    }

    /// Set the maximum data file size in bytes. Default: 2 GiB.
    ///
    /// When an append pushes the active file past this limit the writer
    /// rotates to a fresh file. An empty file always accepts its first
    /// record, whatever its size.
    pub fn max_file_size(mut self, max_file_size: u64) -> Options {
        self.max_file_size = max_file_size;
        self
    }

    /// Force an fsync after every put. Default: `false`.
    pub fn sync_on_put(mut self, sync_on_put: bool) -> Options {
        self.sync_on_put = sync_on_put;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::InvalidArgument(
                "max_file_size needs a positive value".to_string(),
            ));
        }
        Ok(())
    }
}
