//! Error types for the qbak engine

use thiserror::Error;

/// Main error type for backup, restore and task operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("no files selected after applying filters")]
    NoFilesSelected,

    #[error("no changes detected since parent backup")]
    NoChanges,

    #[error("invalid magic header: not a {expected} stream")]
    InvalidMagic { expected: &'static str },

    #[error("password is required for this encrypted file")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    #[error("crc32 mismatch for {path}")]
    CrcMismatch { path: String },

    #[error("corrupt archive: {reason}")]
    CorruptArchive { reason: String },

    #[error("writer is closed")]
    WriterClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("conflict resolution was not provided for {path}")]
    ConflictUnresolved { path: String },

    #[error("scheduling error: {reason}")]
    Schedule { reason: String },
}

impl Error {
    /// Collapse an error into an io::Error carried across pipeline threads.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(err) => err,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias for qbak operations
pub type Result<T> = std::result::Result<T, Error>;
