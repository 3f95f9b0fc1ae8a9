//! Error types for kopi_core.

use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using kopi_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scanning, storing, restoring or framing manifests.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Invalid or missing configuration (empty path, missing password, ...).
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// The source file of a store operation vanished, is unreadable, or is
    /// no longer a regular file.
    #[error("Source file unavailable: {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A non-final block read returned fewer bytes than the block size.
    #[error("Incomplete read of {path} at offset {offset}: expected {expected} bytes, got {actual}")]
    IncompleteRead {
        path: PathBuf,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// A block write stored fewer bytes than requested.
    #[error("Incomplete block write at {path}: expected {expected} bytes, wrote {actual}")]
    IncompleteWrite {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Encryption could not be performed.
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Ciphertext failed to authenticate or is malformed.
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Stored block does not match its recorded hash or size.
    #[error("Corrupt block at {path}: {reason}")]
    CorruptBlock { path: PathBuf, reason: String },

    /// Stored block file is missing.
    #[error("Block not found: {hash} (expected at {path})")]
    BlockNotFound { hash: String, path: PathBuf },

    /// A non-empty file record has no blocks to restore from.
    #[error("Cannot restore non-empty file without blocks: {path}")]
    MissingBlocks { path: String },

    /// A file record's block list does not cover its byte range.
    #[error("Invalid block layout for {path}: {reason}")]
    InvalidBlockLayout { path: String, reason: String },

    /// Destination path already exists.
    #[error("Path already exists: {path}")]
    PathExists { path: PathBuf },

    /// A record path cannot be mapped onto the filesystem.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Catalog already holds an entry for this path.
    #[error("Duplicate path in catalog: {path}")]
    DuplicatePath { path: String },

    /// A record in the stream could not be decoded.
    #[error("Invalid record on line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },

    /// Manifest could not be written or decoded.
    #[error("Manifest error: {reason}")]
    Manifest { reason: String },

    /// Processing was interrupted by the cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a Config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Create an Encryption error.
    pub fn encryption(reason: impl Into<String>) -> Self {
        Error::Encryption {
            reason: reason.into(),
        }
    }

    /// Create a Decryption error.
    pub fn decryption(reason: impl Into<String>) -> Self {
        Error::Decryption {
            reason: reason.into(),
        }
    }

    /// Create a CorruptBlock error.
    pub fn corrupt_block(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptBlock {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a BlockNotFound error.
    pub fn block_not_found(hash: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Error::BlockNotFound {
            hash: hash.into(),
            path: path.into(),
        }
    }

    /// Create a MissingBlocks error.
    pub fn missing_blocks(path: impl Into<String>) -> Self {
        Error::MissingBlocks { path: path.into() }
    }

    /// Create an InvalidBlockLayout error.
    pub fn invalid_block_layout(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidBlockLayout {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a PathExists error.
    pub fn path_exists(path: impl Into<PathBuf>) -> Self {
        Error::PathExists { path: path.into() }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a DuplicatePath error.
    pub fn duplicate_path(path: impl Into<String>) -> Self {
        Error::DuplicatePath { path: path.into() }
    }

    /// Create an InvalidRecord error.
    pub fn invalid_record(line: usize, reason: impl Into<String>) -> Self {
        Error::InvalidRecord {
            line,
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression_error(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create a Manifest error.
    pub fn manifest(reason: impl Into<String>) -> Self {
        Error::Manifest {
            reason: reason.into(),
        }
    }

    /// Map an error opening or stat-ing a store source file. Missing and
    /// unreadable files become `SourceUnavailable`; anything else stays fatal.
    pub fn source_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => Error::SourceUnavailable {
                path: path.into(),
                source,
            },
            _ => Error::Io { source },
        }
    }

    /// Returns true for per-file errors the store stage skips over.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::SourceUnavailable { .. })
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skippable_source_errors() {
        let not_found = Error::source_io("a.txt", std::io::Error::from(ErrorKind::NotFound));
        let denied = Error::source_io("a.txt", std::io::Error::from(ErrorKind::PermissionDenied));
        let other = Error::source_io("a.txt", std::io::Error::other("disk on fire"));

        assert!(not_found.is_skippable());
        assert!(denied.is_skippable());
        assert!(!other.is_skippable());
    }

    #[test]
    fn test_plain_io_errors_are_fatal() {
        // A permission error writing a block is not a source-file problem
        let denied: Error = std::io::Error::from(ErrorKind::PermissionDenied).into();
        assert!(!denied.is_skippable());
    }

    #[test]
    fn test_corruption_is_not_skippable() {
        assert!(!Error::corrupt_block("/store/ab/ab.block", "hash mismatch").is_skippable());
        assert!(!Error::missing_blocks("a.txt").is_skippable());
        assert!(!Error::Cancelled.is_skippable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = Error::corrupt_block("/store/ab/abcd.block", "expected ab, got cd");
        let msg = err.to_string();
        assert!(msg.contains("/store/ab/abcd.block"));
        assert!(msg.contains("expected ab, got cd"));
    }
}
