use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a measurement set sits in the stage pipeline (spec §4.D-G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Converted,
    CalibrationSolved,
    CalibrationApplied,
    Imaged,
    Mosaicked,
}

/// A measurement set product row (spec §3, products database).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsRecord {
    pub ms_path: String,
    pub group_id: String,
    pub stage: ProcessingStage,
    pub calibrator_name: Option<String>,
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
