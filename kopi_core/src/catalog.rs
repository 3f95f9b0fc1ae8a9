//! In-memory snapshot of file metadata, keyed by path.

use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::stream::{RecordReader, RecordSink};
use std::collections::BTreeMap;
use std::io::BufRead;

/// Mapping from record path to file record. Iteration is sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    files: BTreeMap<String, FileRecord>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; fails if its path is already present.
    pub fn insert(&mut self, record: FileRecord) -> Result<()> {
        if self.files.contains_key(&record.path) {
            return Err(Error::duplicate_path(record.path));
        }
        self.files.insert(record.path.clone(), record);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.files.values_mut()
    }

    /// Load a catalog from a record stream.
    ///
    /// The `modified` flag is transient and is cleared on load.
    pub fn read_from<R: BufRead>(reader: R) -> Result<Self> {
        let mut catalog = Self::new();
        for record in RecordReader::new(reader) {
            let mut record = record?;
            record.modified = false;
            catalog.insert(record)?;
        }
        Ok(catalog)
    }

    /// Emit all records, sorted by path, to `sink`.
    pub fn write_to<S: RecordSink + ?Sized>(&self, sink: &mut S) -> Result<()> {
        for record in self.iter() {
            sink.emit(record)?;
        }
        sink.flush()
    }
}

impl FromIterator<FileRecord> for Catalog {
    /// Later records with a duplicate path replace earlier ones.
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let files = iter.into_iter().map(|r| (r.path.clone(), r)).collect();
        Self { files }
    }
}

impl IntoIterator for Catalog {
    type Item = FileRecord;
    type IntoIter = std::collections::btree_map::IntoValues<String, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_values()
    }
}
