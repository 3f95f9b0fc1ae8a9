//! Filesystem traversal producing the initial record stream.

use crate::error::Result;
use crate::record::FileRecord;
use crate::stream::{CancellationToken, RecordSink};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;

/// Log a running count every this many entries.
const PROGRESS_EVERY: u64 = 1000;

/// Traversal options.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Descend into subdirectories. When false only the root and the regular
    /// files directly inside it are emitted.
    pub recursive: bool,
    /// Mark every record modified, for a first backup with no baseline.
    pub initial: bool,
    /// Honor `.gitignore`, `.ignore` and hidden-file rules.
    pub respect_ignore_files: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            initial: false,
            respect_ignore_files: false,
        }
    }
}

/// Counts from a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    /// Unreadable entries and non-regular files.
    pub skipped: u64,
}

/// Walk `root` in file-name order and emit one record per directory and
/// regular file, the root included.
pub fn scan<S: RecordSink + ?Sized>(
    root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
    sink: &mut S,
) -> Result<ScanStats> {
    tracing::info!(
        path = %root.display(),
        recursive = options.recursive,
        initial = options.initial,
        "indexing"
    );

    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(options.respect_ignore_files)
        .max_depth(if options.recursive { None } else { Some(1) })
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut stats = ScanStats::default();

    for entry in walker {
        cancel.check()?;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_permission_denied(&e) => {
                tracing::warn!(error = %e, "permission denied");
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if is_permission_denied(&e) => {
                tracing::warn!(path = %path.display(), "permission denied");
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            if !options.recursive && entry.depth() > 0 {
                continue;
            }
        } else if !metadata.is_file() {
            tracing::debug!(path = %path.display(), "ignoring non-regular file");
            stats.skipped += 1;
            continue;
        }

        let mut record = FileRecord::from_metadata(path, &metadata)?;
        if record.converted_path {
            tracing::debug!(path = %path.display(), "escaped non-UTF-8 path");
        }
        record.modified = options.initial;

        sink.emit(&record)?;

        if record.is_dir() {
            stats.directories += 1;
        } else {
            stats.files += 1;
            stats.bytes += record.size;
        }

        let seen = stats.files + stats.directories;
        if seen % PROGRESS_EVERY == 0 {
            tracing::info!(files_found = seen, bytes_found = stats.bytes, "indexing progress");
        }
    }

    sink.flush()?;
    tracing::info!(
        files = stats.files,
        directories = stats.directories,
        bytes = stats.bytes,
        skipped = stats.skipped,
        "indexing completed"
    );
    Ok(stats)
}

fn is_permission_denied(err: &ignore::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == ErrorKind::PermissionDenied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(root.join("b.txt"), b"bbbb").unwrap();
        fs::write(root.join("a.txt"), b"aa").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/c.txt"), b"c").unwrap();
        fs::write(root.join(".hidden"), b"h").unwrap();
        temp
    }

    fn scan_paths(root: &Path, options: &ScanOptions) -> (Vec<FileRecord>, ScanStats) {
        let mut records: Vec<FileRecord> = Vec::new();
        let stats = scan(root, options, &CancellationToken::new(), &mut records).unwrap();
        (records, stats)
    }

    fn relative(root: &Path, records: &[FileRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| {
                Path::new(&r.path)
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_recursive_scan_in_name_order() {
        let temp = tree();
        let (records, stats) = scan_paths(temp.path(), &ScanOptions::default());

        assert_eq!(
            relative(temp.path(), &records),
            vec!["", ".hidden", "a.txt", "b.txt", "sub", "sub/c.txt"]
        );
        assert_eq!(stats.files, 4);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.bytes, 8);
    }

    #[test]
    fn test_directories_have_zero_size() {
        let temp = tree();
        let (records, _) = scan_paths(temp.path(), &ScanOptions::default());

        for record in records.iter().filter(|r| r.is_dir()) {
            assert_eq!(record.size, 0);
        }
        let a = records.iter().find(|r| r.path.ends_with("a.txt")).unwrap();
        assert_eq!(a.size, 2);
    }

    #[test]
    fn test_non_recursive_scan() {
        let temp = tree();
        let options = ScanOptions {
            recursive: false,
            ..ScanOptions::default()
        };
        let (records, _) = scan_paths(temp.path(), &options);

        assert_eq!(
            relative(temp.path(), &records),
            vec!["", ".hidden", "a.txt", "b.txt"]
        );
    }

    #[test]
    fn test_initial_marks_modified() {
        let temp = tree();
        let (records, _) = scan_paths(temp.path(), &ScanOptions::default());
        assert!(records.iter().all(|r| !r.modified));

        let options = ScanOptions {
            initial: true,
            ..ScanOptions::default()
        };
        let (records, _) = scan_paths(temp.path(), &options);
        assert!(records.iter().all(|r| r.modified));
    }

    #[test]
    fn test_ignore_rules_optional() {
        let temp = tree();
        let options = ScanOptions {
            respect_ignore_files: true,
            ..ScanOptions::default()
        };
        let (records, _) = scan_paths(temp.path(), &options);
        assert!(!relative(temp.path(), &records).contains(&".hidden".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_skipped() {
        let temp = tree();
        std::os::unix::fs::symlink(temp.path().join("a.txt"), temp.path().join("link")).unwrap();

        let (records, stats) = scan_paths(temp.path(), &ScanOptions::default());
        assert!(!relative(temp.path(), &records).contains(&"link".to_string()));
        assert_eq!(stats.skipped, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_escaped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        if fs::write(temp.path().join(name), b"x").is_err() {
            // Some filesystems refuse non-UTF-8 names
            return;
        }

        let (records, _) = scan_paths(temp.path(), &ScanOptions::default());
        let escaped = records.iter().find(|r| r.converted_path).unwrap();
        assert_eq!(escaped.fs_path().unwrap(), temp.path().join(name));
    }

    #[test]
    fn test_missing_root_fails() {
        let temp = TempDir::new().unwrap();
        let mut records: Vec<FileRecord> = Vec::new();
        let result = scan(
            &temp.path().join("absent"),
            &ScanOptions::default(),
            &CancellationToken::new(),
            &mut records,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cancelled_scan() {
        let temp = tree();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut records: Vec<FileRecord> = Vec::new();
        let result = scan(temp.path(), &ScanOptions::default(), &cancel, &mut records);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(records.is_empty());
    }
}
