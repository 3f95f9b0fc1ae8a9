//! Catalog diffing: mark what changed since a baseline.

use crate::catalog::Catalog;
use serde::Serialize;

/// Counts from a diff run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    /// Entries in the current catalog.
    pub total: usize,
    /// Entries absent from the baseline or with changed metadata.
    pub modified: usize,
    /// Entries whose block list was carried forward from the baseline.
    pub unmodified: usize,
}

/// Mark each entry of `current` as modified or unmodified relative to
/// `baseline`.
///
/// An entry is unmodified when the baseline has the same path with equal size,
/// UTC modification time and mode; its block list is then copied from the
/// baseline so unchanged content is never re-read. Any other entry is marked
/// modified and loses whatever block list it carried.
pub fn diff(baseline: &Catalog, current: &mut Catalog) -> DiffStats {
    let mut stats = DiffStats::default();

    for entry in current.iter_mut() {
        stats.total += 1;
        match baseline.get(&entry.path) {
            Some(previous) if previous.same_metadata(entry) => {
                entry.modified = false;
                entry.blocks = previous.blocks.clone();
                stats.unmodified += 1;
            }
            _ => {
                entry.modified = true;
                entry.blocks.clear();
                stats.modified += 1;
            }
        }
    }

    tracing::info!(
        total = stats.total,
        modified_files = stats.modified,
        "diffing completed"
    );
    stats
}
