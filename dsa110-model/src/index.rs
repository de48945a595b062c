use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single row in the `hdf5_file_index` table (spec §3, component A).
///
/// `group_id` is the filename timestamp floored to the nearest tolerance
/// boundary (default 10 s) so that every shard of one observation shares
/// it; `stored = false` marks a row whose file no longer exists on disk
/// without discarding its lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: String,
    pub filename: String,
    pub group_id: String,
    pub subband_code: String,
    pub timestamp_iso: String,
    pub timestamp_mjd: f64,
    pub file_size_bytes: u64,
    pub modified_time: f64,
    pub indexed_at: DateTime<Utc>,
    pub stored: bool,
}

/// Statistics returned by a single indexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_scanned: usize,
    pub new_indexed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
}
