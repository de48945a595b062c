use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a [`DataRecord`] reached the published state (spec §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    Auto,
    Manual,
}

/// Lifecycle of a data product moving from a staging area to its published
/// location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationStatus {
    Staged,
    Published,
    Rejected,
}

/// Data types subject to QA gating on auto-publish (spec §4.J: "science
/// data types").
pub const SCIENCE_DATA_TYPES: [&str; 4] = ["image", "mosaic", "calib_ms", "caltable"];

/// A data product tracked by the data registry, from raw HDF5 shard through
/// mosaic, with its publish state and provenance (spec §3, data-registry
/// database).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub record_id: String,
    pub product_type: String,
    pub staging_path: String,
    pub published_path: Option<String>,
    pub status: FinalizationStatus,
    pub publish_mode: Option<PublishMode>,
    pub qa_status: Option<String>,
    pub validation_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl DataRecord {
    /// Whether this record's current QA/validation fields satisfy the
    /// auto-publish criteria (spec §4.J): validated always required, plus
    /// a passed QA status for science product types.
    pub fn meets_auto_publish_criteria(&self) -> bool {
        if self.validation_status.as_deref() != Some("validated") {
            return false;
        }
        if SCIENCE_DATA_TYPES.contains(&self.product_type.as_str()) {
            return self.qa_status.as_deref() == Some("passed");
        }
        true
    }
}

/// A lineage edge: `child_id` was derived from `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRelationship {
    pub parent_id: String,
    pub child_id: String,
    pub relationship: String,
}
