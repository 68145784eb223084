use std::path::PathBuf;

use thiserror::Error;

/// The `Error` type for store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("An IO error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// SystemTime error.
    #[error("A system time error occurred: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    /// The directory is locked for writing by a live process.
    #[error("Directory {0} is locked for writing by another process")]
    WriteLocked(PathBuf),

    /// The directory is locked for merging by a live process.
    #[error("Directory {0} is locked for merging by another process")]
    MergeLocked(PathBuf),

    /// A write was attempted on a store opened read-only.
    #[error("Store is open in read-only mode")]
    ReadOnly,

    /// Data corruption error.
    #[error(
        "A data corruption error was detected. Stored checksum: {0:#010x}, Calculated checksum: {1:#010x}"
    )]
    Corruption(u32, u32),

    /// A record could not be fully read at its indexed location.
    #[error("Record truncated or missing at its indexed location")]
    TruncatedRecord,

    /// An argument violates the store's limits.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// The `Result` type for store operations.
pub type Result<T> = std::result::Result<T, Error>;
