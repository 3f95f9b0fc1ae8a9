//! # Kopi Core
//!
//! A deduplicating, content-addressed backup engine.
//!
//! Backups flow as a stream of newline-delimited JSON file records through a
//! chain of stages: a scan indexes a tree, a diff carries block lists forward
//! from a previous index, the block store splits modified files into
//! fixed-size blocks named by their salted BLAKE3 hash, and a manifest
//! snapshots the resulting stream. Restore replays a stream, verifying every
//! block before writing it.
//!
//! ## Features
//!
//! - Salted content addressing: identical blocks are stored once per store
//! - Optional AES-256-GCM encryption with an Argon2id-derived key
//! - Verified restores that never overwrite existing files
//! - Dry-run restores for checking a backup without writing anything
//! - zstd-compressed, optionally encrypted manifests
//!
//! ## Example
//!
//! ```no_run
//! use kopi_core::{BlockStore, KdfParams, Restorer, RestoreStats, SecurityContext};
//! use kopi_core::{FileRecord, ScanOptions, CancellationToken, scan};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ScanOptions { initial: true, ..ScanOptions::default() };
//! let mut records: Vec<FileRecord> = Vec::new();
//! scan(Path::new("./my-data"), &options, &CancellationToken::new(), &mut records)?;
//!
//! let security = SecurityContext::create_or_open(Path::new("./backup"), None, &KdfParams::default())?;
//! let store = BlockStore::new("./backup", security);
//!
//! let mut stored = Vec::new();
//! for record in records {
//!     if let kopi_core::StoreOutcome::Stored { record, .. } = store.store_record(record)? {
//!         stored.push(record);
//!     }
//! }
//!
//! let restorer = Restorer::new(&store, "./restored", false);
//! let mut stats = RestoreStats::default();
//! for record in &stored {
//!     restorer.restore(record, &mut stats)?;
//! }
//! # Ok(())
//! # }
//! ```

mod catalog;
pub mod config;
mod diff;
mod error;
mod hash;
mod manifest;
mod progress;
mod record;
mod restore;
mod scan;
mod security;
mod stage;
mod store;
mod stream;

pub use catalog::Catalog;
pub use diff::{DiffStats, diff};
pub use error::{Error, Result};
pub use hash::{ContentHasher, Hash, salted_hash};
pub use manifest::{
    MANIFEST_DIR, ManifestHeader, ManifestStats, ManifestWriter, list_manifests, manifest_id,
    read_manifest,
};
pub use progress::{Progress, ProgressReporter, ProgressSnapshot};
pub use record::{Block, FileMode, FileRecord, file_modes};
pub use restore::{RestoreStats, Restorer};
pub use scan::{ScanOptions, ScanStats, scan};
pub use security::{KdfParams, Key, Salt, SecurityContext, derive_key};
pub use stage::{
    DiffStage, ManifestReadStage, ManifestWriteStage, RestoreStage, ScanStage, Stage, StoreStage,
};
pub use store::{BlockStore, BlockWrite, DEFAULT_MAX_BLOCK_SIZE, StoreOutcome, StoreStats};
pub use stream::{
    CancellationToken, JsonLinesSink, ProcessOptions, RecordReader, RecordSink, process_records,
};
