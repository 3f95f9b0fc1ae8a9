//! File and block records: the unit of the record stream.

use crate::error::{Error, Result};
use crate::hash::Hash;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// File mode (POSIX type and permission bits).
pub type FileMode = u32;

/// Common file mode bits.
pub mod file_modes {
    use super::FileMode;

    /// Mask selecting the file type bits.
    pub const TYPE_MASK: FileMode = 0o170000;

    /// Mask selecting the permission bits.
    pub const PERMISSION_MASK: FileMode = 0o7777;

    /// Regular file type bits.
    pub const REGULAR_TYPE: FileMode = 0o100000;

    /// Directory type bits.
    pub const DIRECTORY_TYPE: FileMode = 0o040000;

    /// Regular file (non-executable).
    pub const REGULAR: FileMode = 0o100644;

    /// Executable file.
    pub const EXECUTABLE: FileMode = 0o100755;

    /// Directory.
    pub const DIRECTORY: FileMode = 0o040755;
}

/// One stored chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Salted content hash of the block's plaintext.
    pub hash: Hash,
    /// Offset of the block within the owning file.
    pub offset: u64,
    /// Length of the block in bytes.
    pub size: u64,
}

/// Metadata for one filesystem entry (regular file or directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Entry path; base64 of the raw bytes when `converted_path` is set.
    pub path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub converted_path: bool,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub mode: FileMode,
    /// Content must be (re)stored.
    #[serde(default, skip_serializing_if = "is_false")]
    pub modified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl FileRecord {
    /// Create a record for a UTF-8 path with no blocks.
    pub fn new(
        path: impl Into<String>,
        size: u64,
        modified_time: DateTime<Utc>,
        mode: FileMode,
    ) -> Self {
        Self {
            path: path.into(),
            converted_path: false,
            size,
            modified_time,
            mode,
            modified: false,
            blocks: Vec::new(),
        }
    }

    /// Create a record from a filesystem path and its metadata.
    ///
    /// Paths that are not valid UTF-8 are escaped as base64 and flagged.
    pub fn from_metadata(path: &Path, metadata: &fs::Metadata) -> Result<Self> {
        let (encoded, converted) = encode_path(path);
        let mode = mode_from_metadata(metadata);
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let modified_time = DateTime::<Utc>::from(metadata.modified()?);

        Ok(Self {
            path: encoded,
            converted_path: converted,
            size,
            modified_time,
            mode,
            modified: false,
            blocks: Vec::new(),
        })
    }

    /// Whether the record describes a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & file_modes::TYPE_MASK == file_modes::DIRECTORY_TYPE
    }

    /// Permission bits only.
    pub fn permissions(&self) -> FileMode {
        self.mode & file_modes::PERMISSION_MASK
    }

    /// Append a block reference.
    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// The original filesystem path, undoing any base64 escape.
    pub fn fs_path(&self) -> Result<PathBuf> {
        if !self.converted_path {
            return Ok(PathBuf::from(&self.path));
        }

        let bytes = STANDARD_NO_PAD
            .decode(&self.path)
            .map_err(|e| Error::invalid_path(&self.path, format!("bad base64 escape: {e}")))?;
        bytes_to_path(&self.path, bytes)
    }

    /// The record path with any root or prefix removed, suitable for joining
    /// under a destination directory. Parent-directory components are rejected.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let path = self.fs_path()?;
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::invalid_path(
                        &self.path,
                        "parent directory components are not allowed",
                    ));
                }
            }
        }
        Ok(relative)
    }

    /// True when path, size, UTC modification time and mode all match.
    pub fn same_metadata(&self, other: &FileRecord) -> bool {
        self.path == other.path
            && self.size == other.size
            && self.modified_time == other.modified_time
            && self.mode == other.mode
    }

    /// Check that the blocks cover `[0, size)` contiguously in ascending order.
    pub fn validate_blocks(&self) -> Result<()> {
        let mut expected_offset = 0u64;
        for (index, block) in self.blocks.iter().enumerate() {
            if block.offset != expected_offset {
                return Err(Error::invalid_block_layout(
                    &self.path,
                    format!(
                        "block {} starts at offset {}, expected {}",
                        index, block.offset, expected_offset
                    ),
                ));
            }
            if block.size == 0 {
                return Err(Error::invalid_block_layout(
                    &self.path,
                    format!("block {} is empty", index),
                ));
            }
            expected_offset = expected_offset.checked_add(block.size).ok_or_else(|| {
                Error::invalid_block_layout(
                    &self.path,
                    format!("block {} extends past the maximum file size", index),
                )
            })?;
        }

        if expected_offset != self.size {
            return Err(Error::invalid_block_layout(
                &self.path,
                format!(
                    "blocks cover {} bytes, file size is {}",
                    expected_offset, self.size
                ),
            ));
        }
        Ok(())
    }
}

/// Encode a path as text, escaping non-UTF-8 paths as base64.
pub fn encode_path(path: &Path) -> (String, bool) {
    match path.to_str() {
        Some(s) => (s.to_string(), false),
        None => (STANDARD_NO_PAD.encode(path_bytes(path)), true),
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn bytes_to_path(_encoded: &str, bytes: Vec<u8>) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn bytes_to_path(encoded: &str, bytes: Vec<u8>) -> Result<PathBuf> {
    String::from_utf8(bytes)
        .map(PathBuf::from)
        .map_err(|_| Error::invalid_path(encoded, "path is not representable on this platform"))
}

/// Get the file mode (type and permissions) from metadata.
#[cfg(unix)]
pub fn mode_from_metadata(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

/// Get the file mode from metadata (Windows fallback).
#[cfg(not(unix))]
pub fn mode_from_metadata(metadata: &fs::Metadata) -> FileMode {
    if metadata.is_dir() {
        file_modes::DIRECTORY
    } else {
        file_modes::REGULAR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::salted_hash;
    use chrono::TimeZone;

    fn block(data: &[u8], offset: u64) -> Block {
        Block {
            hash: salted_hash(b"salt", data),
            offset,
            size: data.len() as u64,
        }
    }

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn test_serialization_omits_defaults() {
        let record = FileRecord::new("a.txt", 10, sample_time(), file_modes::REGULAR);
        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"path\":\"a.txt\""));
        assert!(json.contains("\"modifiedTime\""));
        assert!(!json.contains("modified\":"));
        assert!(!json.contains("blocks"));
        assert!(!json.contains("convertedPath"));
    }

    #[test]
    fn test_serialization_includes_flag_and_blocks() {
        let mut record = FileRecord::new("a.txt", 3, sample_time(), file_modes::REGULAR);
        record.modified = true;
        record.add_block(block(b"abc", 0));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"modified\":true"));
        assert!(json.contains("\"blocks\":[{\"hash\""));

        let parsed: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_timestamp_offsets_normalize_to_utc() {
        let json_utc = r#"{"path":"a","size":1,"modifiedTime":"2019-03-14T15:09:26Z","mode":33188}"#;
        let json_offset =
            r#"{"path":"a","size":1,"modifiedTime":"2019-03-14T17:09:26+02:00","mode":33188}"#;

        let a: FileRecord = serde_json::from_str(json_utc).unwrap();
        let b: FileRecord = serde_json::from_str(json_offset).unwrap();
        assert!(a.same_metadata(&b));
    }

    #[test]
    fn test_is_dir_and_permissions() {
        let dir = FileRecord::new("d", 0, sample_time(), file_modes::DIRECTORY);
        let file = FileRecord::new("f", 0, sample_time(), file_modes::EXECUTABLE);

        assert!(dir.is_dir());
        assert!(!file.is_dir());
        assert_eq!(file.permissions(), 0o755);
    }

    #[test]
    fn test_relative_path_strips_root() {
        let record = FileRecord::new("/home/user/a.txt", 0, sample_time(), file_modes::REGULAR);
        assert_eq!(
            record.relative_path().unwrap(),
            PathBuf::from("home/user/a.txt")
        );

        let record = FileRecord::new("./data/b.txt", 0, sample_time(), file_modes::REGULAR);
        assert_eq!(record.relative_path().unwrap(), PathBuf::from("data/b.txt"));
    }

    #[test]
    fn test_relative_path_rejects_parent_dir() {
        let record = FileRecord::new("../etc/passwd", 0, sample_time(), file_modes::REGULAR);
        assert!(matches!(
            record.relative_path(),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_roundtrip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = Path::new(OsStr::from_bytes(b"dir/caf\xe9.txt"));
        let (encoded, converted) = encode_path(raw);
        assert!(converted);

        let mut record = FileRecord::new(encoded, 0, sample_time(), file_modes::REGULAR);
        record.converted_path = true;
        assert_eq!(record.fs_path().unwrap(), raw);
    }

    #[test]
    fn test_utf8_path_not_converted() {
        let (encoded, converted) = encode_path(Path::new("dir/café.txt"));
        assert_eq!(encoded, "dir/café.txt");
        assert!(!converted);
    }

    #[test]
    fn test_validate_blocks() {
        let mut record = FileRecord::new("f", 6, sample_time(), file_modes::REGULAR);
        record.add_block(block(b"abc", 0));
        record.add_block(block(b"def", 3));
        assert!(record.validate_blocks().is_ok());

        let mut gap = record.clone();
        gap.blocks[1].offset = 4;
        assert!(gap.validate_blocks().is_err());

        let mut short = record.clone();
        short.size = 7;
        assert!(short.validate_blocks().is_err());

        let mut reordered = record.clone();
        reordered.blocks.swap(0, 1);
        assert!(reordered.validate_blocks().is_err());
    }

    #[test]
    fn test_validate_blocks_rejects_overflowing_layout() {
        let mut record = FileRecord::new("f", u64::MAX, sample_time(), file_modes::REGULAR);
        record.add_block(Block {
            size: u64::MAX,
            ..block(b"abc", 0)
        });
        record.add_block(Block {
            size: 1,
            ..block(b"def", u64::MAX)
        });

        assert!(matches!(
            record.validate_blocks(),
            Err(Error::InvalidBlockLayout { .. })
        ));
    }

    #[test]
    fn test_same_metadata_ignores_blocks_and_flag() {
        let a = FileRecord::new("a", 10, sample_time(), file_modes::REGULAR);
        let mut b = a.clone();
        b.modified = true;
        b.add_block(block(b"0123456789", 0));
        assert!(a.same_metadata(&b));

        let mut c = a.clone();
        c.mode = file_modes::EXECUTABLE;
        assert!(!a.same_metadata(&c));
    }
}
