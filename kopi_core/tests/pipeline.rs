//! End-to-end backup and restore through every stage.

use kopi_core::{
    BlockStore, CancellationToken, Catalog, DiffStage, Error, FileRecord, JsonLinesSink,
    KdfParams, ManifestReadStage, ManifestWriteStage, ProcessOptions, RecordReader, RestoreStage,
    RestoreStats, ScanOptions, ScanStage, SecurityContext, Stage, StoreStage, StoreStats, scan,
};
use secrecy::SecretString;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("docs/deep")).unwrap();
    fs::write(root.join("small.txt"), b"tiny").unwrap();
    fs::write(root.join("empty"), b"").unwrap();
    fs::write(root.join("docs/exact.bin"), vec![7u8; 64]).unwrap();
    let large: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    fs::write(root.join("docs/deep/large.bin"), large).unwrap();
    fs::write(root.join("docs/copy.bin"), vec![7u8; 64]).unwrap();
}

fn scan_tree(root: &Path, initial: bool) -> Vec<FileRecord> {
    let options = ScanOptions {
        initial,
        ..ScanOptions::default()
    };
    let mut stage = ScanStage::new(
        root,
        options,
        ProcessOptions::default(),
        Vec::<FileRecord>::new(),
    )
    .unwrap();
    stage.execute().unwrap();
    stage.into_sink()
}

fn store_records(
    store_dir: &Path,
    password: Option<&SecretString>,
    records: Vec<FileRecord>,
) -> (Vec<FileRecord>, StoreStats) {
    let security = SecurityContext::create_or_open(store_dir, password, &fast_kdf()).unwrap();
    let store = BlockStore::new(store_dir, security)
        .with_max_block_size(64)
        .unwrap();
    let mut stage = StoreStage::new(
        store,
        records,
        ProcessOptions::default(),
        Vec::<FileRecord>::new(),
    )
    .unwrap();
    stage.execute().unwrap();
    let stats = stage.stats().clone();
    (stage.into_sink(), stats)
}

fn restore_records(
    store_dir: &Path,
    dest: &Path,
    password: Option<&SecretString>,
    dry_run: bool,
    records: Vec<FileRecord>,
) -> kopi_core::Result<RestoreStats> {
    let security = SecurityContext::open(store_dir, password, &fast_kdf())?;
    let store = BlockStore::new(store_dir, security);
    let mut stage = RestoreStage::new(store, dest, dry_run, records, ProcessOptions::default())?;
    stage.execute()?;
    Ok(stage.stats().clone())
}

/// Where a scanned absolute path lands under `dest`.
fn restored_path(dest: &Path, original: &Path) -> PathBuf {
    let relative: PathBuf = original
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    dest.join(relative)
}

fn assert_same_tree(src: &Path, dest: &Path) {
    for name in [
        "small.txt",
        "empty",
        "docs/exact.bin",
        "docs/copy.bin",
        "docs/deep/large.bin",
    ] {
        let original = fs::read(src.join(name)).unwrap();
        let restored = fs::read(restored_path(dest, &src.join(name))).unwrap();
        assert_eq!(original, restored, "content of {name} differs");
    }
    assert!(restored_path(dest, &src.join("docs/deep")).is_dir());
}

#[test]
fn test_full_backup_and_restore() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let store_dir = temp.path().join("backup");
    write_tree(&src);

    let scanned = scan_tree(&src, true);
    let (stored, stats) = store_records(&store_dir, None, scanned);

    // large.bin repeats every 256 bytes, so only blocks 0-3 and the 40-byte
    // tail are new; copy.bin duplicates exact.bin
    assert_eq!(stats.files_stored, 5);
    assert_eq!(stats.blocks_written, 7);
    assert_eq!(stats.blocks_reused, 12);
    assert!(store_dir.join("salt").is_file());
    assert!(stored.iter().all(|r| !r.modified));

    let dest = temp.path().join("restore");
    let restore_stats = restore_records(&store_dir, &dest, None, false, stored).unwrap();
    assert_eq!(restore_stats.files, 5);
    assert_same_tree(&src, &dest);
}

#[test]
fn test_incremental_backup_reads_only_changes() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let store_dir = temp.path().join("backup");
    write_tree(&src);

    let (first, _) = store_records(&store_dir, None, scan_tree(&src, true));

    // Change one file's size so the change is visible regardless of mtime resolution
    fs::write(src.join("small.txt"), b"not so tiny anymore").unwrap();

    let baseline: Catalog = first.into_iter().collect();
    let current: Catalog = scan_tree(&src, false).into_iter().collect();
    let mut diff = DiffStage::new(baseline, current, Vec::<FileRecord>::new());
    diff.execute().unwrap();
    assert_eq!(diff.stats().modified, 1);

    let (second, stats) = store_records(&store_dir, None, diff.into_sink());
    assert_eq!(stats.files_stored, 1);
    assert_eq!(stats.bytes_read, 19);

    let dest = temp.path().join("restore");
    restore_records(&store_dir, &dest, None, false, second).unwrap();
    assert_same_tree(&src, &dest);
}

#[test]
fn test_encrypted_manifest_roundtrip() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let store_dir = temp.path().join("backup");
    write_tree(&src);
    let password = SecretString::from("correct horse battery staple");

    let (stored, _) = store_records(&store_dir, Some(&password), scan_tree(&src, true));

    let security = SecurityContext::open(&store_dir, Some(&password), &fast_kdf()).unwrap();
    let mut write = ManifestWriteStage::new(
        &store_dir,
        security,
        "nightly",
        stored.clone(),
        ProcessOptions::default(),
    )
    .unwrap();
    write.execute().unwrap();
    let id = write.stats().unwrap().id.clone();
    assert!(store_dir.join("manifests").join(&id).is_file());

    // Replay through the newline-delimited wire format
    let security = SecurityContext::open(&store_dir, Some(&password), &fast_kdf()).unwrap();
    let sink = JsonLinesSink::new(Vec::new());
    let mut read = ManifestReadStage::new(&store_dir, security, &id, sink).unwrap();
    read.execute().unwrap();
    assert_eq!(read.header().unwrap().description, "nightly");

    let bytes = read.into_sink().into_inner();
    let replayed = RecordReader::new(Cursor::new(bytes)).read_all().unwrap();
    assert_eq!(replayed, stored);

    let dest = temp.path().join("restore");
    restore_records(&store_dir, &dest, Some(&password), false, replayed.clone()).unwrap();
    assert_same_tree(&src, &dest);

    // Without the password every block fails verification
    let other = temp.path().join("restore-plain");
    let result = restore_records(&store_dir, &other, None, true, replayed);
    assert!(matches!(result, Err(Error::CorruptBlock { .. })));
}

#[test]
fn test_dry_run_detects_corruption() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let store_dir = temp.path().join("backup");
    write_tree(&src);

    let (stored, _) = store_records(&store_dir, None, scan_tree(&src, true));
    let dest = temp.path().join("restore");

    let stats = restore_records(&store_dir, &dest, None, true, stored.clone()).unwrap();
    assert!(stats.dry_run);
    assert!(!dest.exists());

    let large = stored
        .iter()
        .find(|r| r.path.ends_with("large.bin"))
        .unwrap();
    let victim = store_dir
        .join(large.blocks[3].hash.prefix())
        .join(format!("{}.block", large.blocks[3].hash.to_hex()));
    let mut raw = fs::read(&victim).unwrap();
    raw[0] ^= 0x01;
    fs::write(&victim, raw).unwrap();

    let result = restore_records(&store_dir, &dest, None, true, stored);
    assert!(matches!(result, Err(Error::CorruptBlock { .. })));
    assert!(!dest.exists());
}

#[test]
fn test_restore_requires_salt() {
    let temp = TempDir::new().unwrap();
    let result = restore_records(
        &temp.path().join("missing"),
        &temp.path().join("dest"),
        None,
        false,
        Vec::new(),
    );
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[test]
fn test_cancelled_scan_stops_pipeline() {
    let temp = TempDir::new().unwrap();
    write_tree(temp.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut records: Vec<FileRecord> = Vec::new();
    let result = scan(temp.path(), &ScanOptions::default(), &cancel, &mut records);
    assert!(matches!(result, Err(Error::Cancelled)));
}
