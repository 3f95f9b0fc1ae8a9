//! Manifests: named, timestamped snapshots of a record stream.
//!
//! A manifest file holds one JSON header line followed by the records, one
//! per line, compressed with zstd and then encoded by the store's security
//! context. Files live at `<store>/manifests/<YYYY>/<MM>/<DD>/<unix ts>.manifest`;
//! the path below `manifests/` is the manifest ID.

use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::security::SecurityContext;
use crate::stream::{RecordReader, RecordSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Directory under the store root holding manifests.
pub const MANIFEST_DIR: &str = "manifests";

/// zstd compression level for manifests.
const COMPRESSION_LEVEL: i32 = 3;

/// First line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestHeader {
    #[serde(rename = "ID")]
    pub id: String,
    pub date: DateTime<Utc>,
    pub description: String,
}

impl ManifestHeader {
    /// Header for a manifest created at `date`.
    pub fn new(date: DateTime<Utc>, description: impl Into<String>) -> Self {
        Self {
            id: manifest_id(date),
            date,
            description: description.into(),
        }
    }
}

/// Counts from writing or reading a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestStats {
    pub id: String,
    pub files: u64,
    pub bytes: u64,
    /// Size of the manifest file.
    pub encoded_size: u64,
}

/// Manifest ID for a creation time: `YYYY/MM/DD/<unix ts>.manifest`.
pub fn manifest_id(date: DateTime<Utc>) -> String {
    format!("{}/{}.manifest", date.format("%Y/%m/%d"), date.timestamp())
}

/// Path of manifest `id` under `store_root`. IDs must be relative and free of
/// parent-directory components.
pub fn manifest_path(store_root: &Path, id: &str) -> Result<PathBuf> {
    if id.is_empty() {
        return Err(Error::config("manifest ID cannot be empty"));
    }
    let relative = Path::new(id);
    let valid = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(Error::manifest(format!("invalid manifest ID {:?}", id)));
    }
    Ok(store_root.join(MANIFEST_DIR).join(relative))
}

/// Sink that accumulates records into a compressed manifest body.
///
/// Records are written in the order they are emitted; `finish` seals the
/// body and writes the manifest file.
pub struct ManifestWriter<'a> {
    security: &'a SecurityContext,
    header: ManifestHeader,
    encoder: zstd::stream::Encoder<'static, Vec<u8>>,
    files: u64,
    bytes: u64,
}

impl<'a> ManifestWriter<'a> {
    pub fn new(security: &'a SecurityContext, header: ManifestHeader) -> Result<Self> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), COMPRESSION_LEVEL)
            .map_err(|e| Error::compression_error(format!("zstd init failed: {e}")))?;
        write_json_line(&mut encoder, &header)?;

        Ok(Self {
            security,
            header,
            encoder,
            files: 0,
            bytes: 0,
        })
    }

    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    /// Compress, encode and write the manifest under `store_root`. An existing
    /// manifest with the same ID is never replaced.
    pub fn finish(self, store_root: &Path) -> Result<ManifestStats> {
        let compressed = self
            .encoder
            .finish()
            .map_err(|e| Error::compression_error(format!("zstd compression failed: {e}")))?;
        tracing::info!(size = compressed.len(), "compressed manifest created");

        let encoded = self.security.encode(&compressed)?;
        tracing::debug!(size = encoded.len(), "encoded compressed manifest");

        let path = manifest_path(store_root, &self.header.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    Error::path_exists(&path)
                } else {
                    e.into()
                }
            })?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        tracing::info!(
            id = %self.header.id,
            files = self.files,
            bytes = self.bytes,
            "created manifest"
        );

        Ok(ManifestStats {
            id: self.header.id,
            files: self.files,
            bytes: self.bytes,
            encoded_size: encoded.len() as u64,
        })
    }
}

impl RecordSink for ManifestWriter<'_> {
    fn emit(&mut self, record: &FileRecord) -> Result<()> {
        write_json_line(&mut self.encoder, record)?;
        self.files += 1;
        self.bytes += record.size;
        Ok(())
    }
}

fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, value).map_err(std::io::Error::from)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Read manifest `id`, replay its records into `sink` in stored order and
/// return the header.
pub fn read_manifest<S: RecordSink + ?Sized>(
    store_root: &Path,
    id: &str,
    security: &SecurityContext,
    sink: &mut S,
) -> Result<(ManifestHeader, ManifestStats)> {
    let path = manifest_path(store_root, id)?;
    let encoded = fs::read(&path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            Error::manifest(format!("manifest {} not found", id))
        } else {
            e.into()
        }
    })?;
    let encoded_size = encoded.len() as u64;

    let compressed = security
        .decode(encoded)
        .map_err(|e| Error::manifest(format!("failed to decode manifest: {e}")))?;
    let decoder = zstd::stream::Decoder::new(compressed.as_slice())
        .map_err(|e| Error::compression_error(format!("zstd init failed: {e}")))?;
    let mut reader = BufReader::new(decoder);

    let header = read_header(&mut reader)?;
    tracing::info!(
        id = %header.id,
        date = %header.date,
        description = %header.description,
        "read manifest header"
    );

    let mut stats = ManifestStats {
        id: header.id.clone(),
        encoded_size,
        ..ManifestStats::default()
    };

    // Record line numbers continue after the header
    for record in RecordReader::new(reader) {
        let record = record.map_err(|e| match e {
            Error::InvalidRecord { line, reason } => Error::invalid_record(line + 1, reason),
            other => other,
        })?;
        sink.emit(&record)?;
        stats.files += 1;
        stats.bytes += record.size;
    }
    sink.flush()?;

    Ok((header, stats))
}

fn read_header<R: Read>(reader: &mut BufReader<R>) -> Result<ManifestHeader> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| Error::compression_error(format!("zstd decompression failed: {e}")))?;
    if read == 0 {
        return Err(Error::manifest("manifest is empty"));
    }
    serde_json::from_str(line.trim())
        .map_err(|e| Error::manifest(format!("failed to decode manifest header: {e}")))
}

/// IDs of all manifests under `store_root`, oldest first.
pub fn list_manifests(store_root: &Path) -> Result<Vec<String>> {
    let dir = store_root.join(MANIFEST_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    let walker = ignore::WalkBuilder::new(&dir)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("manifest") {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(&dir) {
            ids.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }

    ids.sort();
    Ok(ids)
}
