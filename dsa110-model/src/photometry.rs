use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single flux measurement of a cross-matched source in one mosaic
/// (spec §3, §4.H).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryMeasurement {
    pub source_name: String,
    pub catalog: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub mosaic_id: String,
    pub flux_jy: f64,
    pub flux_err_jy: f64,
    pub observed_at: DateTime<Utc>,
}
