//! Content-addressed block storage.
//!
//! Blocks live at `<root>/<first two hex chars>/<hex>.block`. A block file is
//! the encoded (possibly encrypted) plaintext; its name is the salted hash of
//! the plaintext, so identical content is stored once.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::record::{Block, FileRecord, mode_from_metadata};
use crate::security::SecurityContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// File extension of stored blocks.
pub const BLOCK_EXTENSION: &str = "block";

/// Default upper bound on block length: 10 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

/// A block store rooted at a directory, with the security context used to
/// hash and encode its contents.
#[derive(Debug)]
pub struct BlockStore {
    root: PathBuf,
    security: SecurityContext,
    max_block_size: u64,
}

/// Result of writing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    /// A new block file of this many encoded bytes was created.
    Written(u64),
    /// A block with this hash already existed.
    Existing,
}

/// Per-file outcome of `BlockStore::store_record`.
#[derive(Debug)]
pub enum StoreOutcome {
    /// Directory or unmodified file; no content was read.
    PassedThrough(FileRecord),
    /// Content was read and its blocks are present in the store.
    Stored {
        record: FileRecord,
        blocks_written: u64,
        blocks_reused: u64,
        bytes_written: u64,
    },
    /// The source file vanished or could not be read.
    Skipped { path: String, error: Error },
}

/// Counts from a store run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files_stored: u64,
    pub files_passed_through: u64,
    pub files_skipped: u64,
    pub blocks_written: u64,
    pub blocks_reused: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl StoreStats {
    /// Fold one outcome into the totals.
    pub fn add(&mut self, outcome: &StoreOutcome) {
        match outcome {
            StoreOutcome::PassedThrough(_) => self.files_passed_through += 1,
            StoreOutcome::Stored {
                record,
                blocks_written,
                blocks_reused,
                bytes_written,
            } => {
                self.files_stored += 1;
                self.blocks_written += blocks_written;
                self.blocks_reused += blocks_reused;
                self.bytes_read += record.size;
                self.bytes_written += bytes_written;
            }
            StoreOutcome::Skipped { .. } => self.files_skipped += 1,
        }
    }
}

impl BlockStore {
    /// Create a handle on the store at `root`. Directories are created lazily
    /// as blocks are written.
    pub fn new(root: impl Into<PathBuf>, security: SecurityContext) -> Self {
        Self {
            root: root.into(),
            security,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    /// Set the maximum block length. Must be positive.
    pub fn with_max_block_size(mut self, max_block_size: u64) -> Result<Self> {
        if max_block_size == 0 {
            return Err(Error::config("maximum block size must be positive"));
        }
        self.max_block_size = max_block_size;
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    pub fn max_block_size(&self) -> u64 {
        self.max_block_size
    }

    /// Path of the block file for `hash`.
    pub fn block_path(&self, hash: &Hash) -> PathBuf {
        self.root
            .join(hash.prefix())
            .join(format!("{}.{}", hash.to_hex(), BLOCK_EXTENSION))
    }

    /// Whether a block file for `hash` exists.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.block_path(hash).is_file()
    }

    /// Store the content of a record if needed.
    ///
    /// Directories pass through with `modified` cleared; unmodified files pass
    /// through untouched. Modified regular files are split into blocks; a
    /// source that vanished or is unreadable yields `StoreOutcome::Skipped`.
    /// Every other failure is returned as an error.
    pub fn store_record(&self, mut record: FileRecord) -> Result<StoreOutcome> {
        if record.is_dir() {
            record.modified = false;
            return Ok(StoreOutcome::PassedThrough(record));
        }
        if !record.modified {
            return Ok(StoreOutcome::PassedThrough(record));
        }

        let path = record.path.clone();
        match self.store_file(record) {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.is_skippable() => {
                tracing::warn!(path = %path, error = %error, "skipping unreadable file");
                Ok(StoreOutcome::Skipped { path, error })
            }
            Err(error) => Err(error),
        }
    }

    fn store_file(&self, mut record: FileRecord) -> Result<StoreOutcome> {
        let source = record.fs_path()?;
        refresh_metadata(&mut record, &source)?;

        let file = File::open(&source).map_err(|e| Error::source_io(&source, e))?;
        let mut reader = file.take(record.size);

        record.blocks.clear();
        let mut blocks_written = 0;
        let mut blocks_reused = 0;
        let mut bytes_written = 0;

        let capacity = record.size.min(self.max_block_size) as usize;
        let mut buf = Vec::with_capacity(capacity);
        let mut offset = 0u64;

        while offset < record.size {
            buf.clear();
            let read = reader
                .by_ref()
                .take(self.max_block_size)
                .read_to_end(&mut buf)? as u64;
            let expected = self.max_block_size.min(record.size - offset);
            if read != expected {
                return Err(Error::IncompleteRead {
                    path: source.clone(),
                    offset,
                    expected,
                    actual: read,
                });
            }

            let hash = self.security.new_hasher().update(&buf).finalize();
            match self.write_block(&hash, &buf)? {
                BlockWrite::Written(encoded) => {
                    blocks_written += 1;
                    bytes_written += encoded;
                }
                BlockWrite::Existing => blocks_reused += 1,
            }

            record.add_block(Block {
                hash,
                offset,
                size: read,
            });
            offset += read;
        }

        record.modified = false;
        tracing::debug!(
            path = %record.path,
            size = record.size,
            blocks = record.blocks.len(),
            blocks_written,
            "stored file"
        );

        Ok(StoreOutcome::Stored {
            record,
            blocks_written,
            blocks_reused,
            bytes_written,
        })
    }

    /// Write one block of plaintext under `hash` unless it is already present.
    ///
    /// The encoded payload goes to a temporary file in the fan-out directory
    /// and is moved into place without replacing an existing block.
    pub fn write_block(&self, hash: &Hash, plaintext: &[u8]) -> Result<BlockWrite> {
        let path = self.block_path(hash);
        if path.exists() {
            tracing::trace!(hash = %hash, "block already stored");
            return Ok(BlockWrite::Existing);
        }

        let encoded = self.security.encode(plaintext)?;
        let outcome = persist_block(&path, &encoded)?;
        if outcome == BlockWrite::Existing {
            tracing::debug!(hash = %hash, "block stored concurrently");
        }
        Ok(outcome)
    }

    /// Read, decode and verify one block, returning exactly `block.size`
    /// bytes of plaintext.
    pub fn read_block(&self, block: &Block) -> Result<Vec<u8>> {
        let path = self.block_path(&block.hash);
        let encoded = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::block_not_found(block.hash.to_hex(), &path));
            }
            Err(e) => return Err(e.into()),
        };

        let mut plaintext = self.security.decode(encoded).map_err(|e| match e {
            Error::Decryption { reason } => corrupt(&path, format!("cannot decode: {reason}")),
            other => other,
        })?;

        let size = block.size as usize;
        if plaintext.len() < size {
            return Err(corrupt(
                &path,
                format!(
                    "decoded {} bytes, expected at least {}",
                    plaintext.len(),
                    block.size
                ),
            ));
        }

        let actual = self.security.new_hasher().update(&plaintext[..size]).finalize();
        if actual != block.hash {
            return Err(corrupt(
                &path,
                format!(
                    "hash mismatch: expected {}, got {}",
                    block.hash.to_hex(),
                    actual.to_hex()
                ),
            ));
        }

        plaintext.truncate(size);
        Ok(plaintext)
    }
}

/// Move `encoded` into place at `path` through a temporary file in the same
/// directory. A block that appeared at `path` in the meantime is kept and
/// reported as `BlockWrite::Existing`.
fn persist_block(path: &Path, encoded: &[u8]) -> Result<BlockWrite> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::config(format!("invalid block path {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    temp_file.write_all(encoded)?;
    temp_file.flush()?;

    let written = temp_file.as_file().metadata()?.len();
    if written != encoded.len() as u64 {
        return Err(Error::IncompleteWrite {
            path: path.to_path_buf(),
            expected: encoded.len() as u64,
            actual: written,
        });
    }

    match temp_file.persist_noclobber(path) {
        Ok(_) => Ok(BlockWrite::Written(written)),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(BlockWrite::Existing),
        Err(e) => Err(e.into()),
    }
}

fn corrupt(path: &Path, reason: String) -> Error {
    tracing::error!(path = %path.display(), reason = %reason, "corrupt block");
    Error::corrupt_block(path, reason)
}

/// Replace the record's size, modification time and mode with a fresh stat of
/// `source`, logging any drift since the record was produced.
fn refresh_metadata(record: &mut FileRecord, source: &Path) -> Result<()> {
    let metadata = fs::metadata(source).map_err(|e| Error::source_io(source, e))?;
    if !metadata.is_file() {
        return Err(Error::source_io(
            source,
            std::io::Error::new(ErrorKind::NotFound, "no longer a regular file"),
        ));
    }

    let size = metadata.len();
    let modified_time = DateTime::<Utc>::from(metadata.modified()?);
    let mode = mode_from_metadata(&metadata);

    if size != record.size {
        tracing::warn!(path = %record.path, old = record.size, new = size, "file size changed");
    }
    if modified_time != record.modified_time {
        tracing::warn!(
            path = %record.path,
            old = %record.modified_time,
            new = %modified_time,
            "file modification time changed"
        );
    }
    if mode != record.mode {
        tracing::warn!(path = %record.path, old = record.mode, new = mode, "file mode changed");
    }

    record.size = size;
    record.modified_time = modified_time;
    record.mode = mode;
    Ok(())
}
