use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`MosaicGroup`] (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MosaicStatus {
    Collecting,
    Ready,
    Building,
    Completed,
    Failed,
}

/// A sliding window of measurement sets to be combined into one mosaic
/// (spec §3, §4.I: 10-MS window, 2-MS overlap).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicGroup {
    pub mosaic_id: String,
    pub status: MosaicStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Association between a [`MosaicGroup`] and one of the measurement sets
/// feeding it. A single MS can belong to two consecutive windows because of
/// the 2-MS overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicMembership {
    pub mosaic_id: String,
    pub ms_path: String,
    pub sequence_index: u32,
}
