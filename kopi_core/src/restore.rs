//! Rebuild files and directories from stored blocks.

use crate::error::{Error, Result};
use crate::record::{FileMode, FileRecord};
use crate::store::BlockStore;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Counts from a restore run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreStats {
    pub directories: u64,
    pub files: u64,
    pub blocks_verified: u64,
    pub bytes_restored: u64,
    pub dry_run: bool,
}

/// Restores records under a destination directory.
///
/// In dry-run mode every block is still read, decoded and verified, but
/// nothing is created under the destination.
#[derive(Debug)]
pub struct Restorer<'a> {
    store: &'a BlockStore,
    dest: PathBuf,
    dry_run: bool,
}

impl<'a> Restorer<'a> {
    pub fn new(store: &'a BlockStore, dest: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            store,
            dest: dest.into(),
            dry_run,
        }
    }

    /// Where `record` lands under the destination directory.
    pub fn destination(&self, record: &FileRecord) -> Result<PathBuf> {
        Ok(self.dest.join(record.relative_path()?))
    }

    /// Restore one record, adding to `stats`.
    pub fn restore(&self, record: &FileRecord, stats: &mut RestoreStats) -> Result<()> {
        stats.dry_run = self.dry_run;
        let target = self.destination(record)?;

        if record.is_dir() {
            if !self.dry_run {
                create_dir(&target, record.permissions())?;
            }
            stats.directories += 1;
            tracing::debug!(path = %record.path, "restored directory");
            return Ok(());
        }

        self.restore_file(record, &target, stats)?;
        stats.files += 1;
        tracing::debug!(path = %record.path, size = record.size, "restored file");
        Ok(())
    }

    fn restore_file(
        &self,
        record: &FileRecord,
        target: &Path,
        stats: &mut RestoreStats,
    ) -> Result<()> {
        if record.size > 0 && record.blocks.is_empty() {
            return Err(Error::missing_blocks(&record.path));
        }
        record.validate_blocks()?;

        let mut output = if self.dry_run {
            None
        } else {
            Some(create_file(target, record.permissions())?)
        };

        for block in &record.blocks {
            let data = self.store.read_block(block)?;
            stats.blocks_verified += 1;

            if let Some(file) = output.as_mut() {
                file.write_all(&data)?;
                stats.bytes_restored += data.len() as u64;
            }
        }

        if let Some(file) = output {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_dir(path: &Path, permissions: FileMode) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(permissions)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir(path: &Path, _permissions: FileMode) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Create `path` exclusively; an existing file is never overwritten.
fn create_file(path: &Path, permissions: FileMode) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(permissions);
    }
    #[cfg(not(unix))]
    let _ = permissions;

    options.open(path).map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
            Error::path_exists(path)
        } else {
            e.into()
        }
    })
}
