//! Pipeline stages: each owns its configuration, input and output.

use crate::catalog::Catalog;
use crate::config::require_path;
use crate::diff::{DiffStats, diff};
use crate::error::Result;
use crate::manifest::{ManifestHeader, ManifestStats, ManifestWriter, read_manifest};
use crate::record::FileRecord;
use crate::restore::{RestoreStats, Restorer};
use crate::scan::{ScanOptions, ScanStats, scan};
use crate::security::SecurityContext;
use crate::store::{BlockStore, StoreOutcome, StoreStats};
use crate::stream::{ProcessOptions, RecordSink, process_records};
use chrono::Utc;
use std::mem;
use std::path::{Path, PathBuf};

/// One step of a backup or restore pipeline.
pub trait Stage {
    /// Run the stage to completion.
    fn execute(&mut self) -> Result<()>;
}

/// Walks a directory tree and emits its records.
pub struct ScanStage<S: RecordSink> {
    root: PathBuf,
    options: ScanOptions,
    process: ProcessOptions,
    sink: S,
    stats: ScanStats,
}

impl<S: RecordSink> ScanStage<S> {
    pub fn new(
        root: impl Into<PathBuf>,
        options: ScanOptions,
        process: ProcessOptions,
        sink: S,
    ) -> Result<Self> {
        let root = root.into();
        require_path("scan path", &root)?;
        Ok(Self {
            root,
            options,
            process,
            sink,
            stats: ScanStats::default(),
        })
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: RecordSink> Stage for ScanStage<S> {
    fn execute(&mut self) -> Result<()> {
        self.stats = scan(&self.root, &self.options, &self.process.cancel, &mut self.sink)?;
        Ok(())
    }
}

/// Marks the current catalog against a baseline and emits it sorted by path.
pub struct DiffStage<S: RecordSink> {
    baseline: Catalog,
    current: Catalog,
    sink: S,
    stats: DiffStats,
}

impl<S: RecordSink> DiffStage<S> {
    pub fn new(baseline: Catalog, current: Catalog, sink: S) -> Self {
        Self {
            baseline,
            current,
            sink,
            stats: DiffStats::default(),
        }
    }

    pub fn stats(&self) -> &DiffStats {
        &self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: RecordSink> Stage for DiffStage<S> {
    fn execute(&mut self) -> Result<()> {
        self.stats = diff(&self.baseline, &mut self.current);
        self.current.write_to(&mut self.sink)
    }
}

/// Stores modified file content and emits the updated records.
///
/// Records whose source vanished or became unreadable are dropped from the
/// output and counted as skipped.
pub struct StoreStage<S: RecordSink> {
    store: BlockStore,
    records: Vec<FileRecord>,
    process: ProcessOptions,
    sink: S,
    stats: StoreStats,
}

impl<S: RecordSink> StoreStage<S> {
    pub fn new(
        store: BlockStore,
        records: Vec<FileRecord>,
        process: ProcessOptions,
        sink: S,
    ) -> Result<Self> {
        require_path("output directory", store.root())?;
        Ok(Self {
            store,
            records,
            process,
            sink,
            stats: StoreStats::default(),
        })
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: RecordSink> Stage for StoreStage<S> {
    fn execute(&mut self) -> Result<()> {
        tracing::info!(destination = %self.store.root().display(), "beginning to store files");

        let records = mem::take(&mut self.records);
        let store = &self.store;
        let stats = &mut self.stats;
        let sink = &mut self.sink;

        process_records(records, &self.process, |record| {
            let outcome = store.store_record(record)?;
            stats.add(&outcome);
            match outcome {
                StoreOutcome::PassedThrough(record) | StoreOutcome::Stored { record, .. } => {
                    sink.emit(&record)
                }
                StoreOutcome::Skipped { .. } => Ok(()),
            }
        })?;
        self.sink.flush()?;

        tracing::info!(
            files_stored = self.stats.files_stored,
            files_skipped = self.stats.files_skipped,
            blocks_written = self.stats.blocks_written,
            blocks_reused = self.stats.blocks_reused,
            bytes_written = self.stats.bytes_written,
            "store completed"
        );
        Ok(())
    }
}

/// Restores records under a destination directory.
pub struct RestoreStage {
    store: BlockStore,
    dest: PathBuf,
    dry_run: bool,
    records: Vec<FileRecord>,
    process: ProcessOptions,
    stats: RestoreStats,
}

impl RestoreStage {
    pub fn new(
        store: BlockStore,
        dest: impl Into<PathBuf>,
        dry_run: bool,
        records: Vec<FileRecord>,
        process: ProcessOptions,
    ) -> Result<Self> {
        let dest = dest.into();
        require_path("input directory", store.root())?;
        require_path("output directory", &dest)?;
        Ok(Self {
            store,
            dest,
            dry_run,
            records,
            process,
            stats: RestoreStats::default(),
        })
    }

    pub fn stats(&self) -> &RestoreStats {
        &self.stats
    }
}

impl Stage for RestoreStage {
    fn execute(&mut self) -> Result<()> {
        tracing::info!(
            destination = %self.dest.display(),
            dry_run = self.dry_run,
            "beginning to restore files"
        );

        let restorer = Restorer::new(&self.store, &self.dest, self.dry_run);
        let stats = &mut self.stats;
        stats.dry_run = self.dry_run;

        let records = mem::take(&mut self.records);
        process_records(records, &self.process, |record| {
            restorer.restore(&record, stats)
        })?;

        tracing::info!(
            files = self.stats.files,
            directories = self.stats.directories,
            blocks_verified = self.stats.blocks_verified,
            bytes_restored = self.stats.bytes_restored,
            "restore completed"
        );
        Ok(())
    }
}

/// Bundles a record stream into a new manifest.
pub struct ManifestWriteStage {
    store_root: PathBuf,
    security: SecurityContext,
    description: String,
    records: Vec<FileRecord>,
    process: ProcessOptions,
    stats: Option<ManifestStats>,
}

impl ManifestWriteStage {
    pub fn new(
        store_root: impl Into<PathBuf>,
        security: SecurityContext,
        description: impl Into<String>,
        records: Vec<FileRecord>,
        process: ProcessOptions,
    ) -> Result<Self> {
        let store_root = store_root.into();
        require_path("output directory", &store_root)?;
        Ok(Self {
            store_root,
            security,
            description: description.into(),
            records,
            process,
            stats: None,
        })
    }

    /// Stats of the written manifest, including its ID, once executed.
    pub fn stats(&self) -> Option<&ManifestStats> {
        self.stats.as_ref()
    }
}

impl Stage for ManifestWriteStage {
    fn execute(&mut self) -> Result<()> {
        let header = ManifestHeader::new(Utc::now(), self.description.clone());
        let mut writer = ManifestWriter::new(&self.security, header)?;

        let records = mem::take(&mut self.records);
        process_records(records, &self.process, |record| writer.emit(&record))?;

        self.stats = Some(writer.finish(&self.store_root)?);
        Ok(())
    }
}

/// Replays a manifest's records into a sink.
pub struct ManifestReadStage<S: RecordSink> {
    store_root: PathBuf,
    security: SecurityContext,
    id: String,
    sink: S,
    header: Option<ManifestHeader>,
    stats: ManifestStats,
}

impl<S: RecordSink> ManifestReadStage<S> {
    pub fn new(
        store_root: impl Into<PathBuf>,
        security: SecurityContext,
        id: impl Into<String>,
        sink: S,
    ) -> Result<Self> {
        let store_root = store_root.into();
        let id = id.into();
        require_path("input directory", &store_root)?;
        require_path("manifest ID", Path::new(&id))?;
        Ok(Self {
            store_root,
            security,
            id,
            sink,
            header: None,
            stats: ManifestStats::default(),
        })
    }

    pub fn header(&self) -> Option<&ManifestHeader> {
        self.header.as_ref()
    }

    pub fn stats(&self) -> &ManifestStats {
        &self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: RecordSink> Stage for ManifestReadStage<S> {
    fn execute(&mut self) -> Result<()> {
        let (header, stats) =
            read_manifest(&self.store_root, &self.id, &self.security, &mut self.sink)?;
        self.header = Some(header);
        self.stats = stats;
        Ok(())
    }
}
