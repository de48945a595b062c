use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::Result;

/// UVH5 shard(s) to measurement-set conversion. The real implementation
/// shells out to the observatory's conversion tool; modeled here so the
/// grouping and queue logic around it can be tested without it.
#[async_trait]
pub trait ExternalConverter: Send + Sync {
    async fn convert(&self, inputs: &[&Path], output: &Path) -> Result<()>;
}

/// Calibration table solve/apply, delegated to the external calibration
/// engine (spec §4.F Non-goal: the CASA solver itself).
#[async_trait]
pub trait ExternalCalibrationEngine: Send + Sync {
    /// Solve for delay/bandpass/gain on `ms_path`, phased to `calibrator_name`
    /// using `refant` as the CASA-format reference antenna chain. `mode`
    /// selects the phase center used for the solve (spec §4.F step 3:
    /// `"calibrator"`, `"median_meridian"`, or `"manual"`); for `"manual"`,
    /// `manual_ra_deg`/`manual_dec_deg` give the phase center directly.
    /// Returns the produced table paths in application order (K, B, G).
    async fn solve(
        &self,
        ms_path: &Path,
        calibrator_name: &str,
        refant: &str,
        mode: &str,
        manual_ra_deg: Option<f64>,
        manual_dec_deg: Option<f64>,
    ) -> Result<Vec<String>>;

    /// Apply `caltables` (in application order) to `ms_path` with the
    /// matching per-table interpolation kind (e.g. `"nearest"`, `"linear"`).
    async fn apply(&self, ms_path: &Path, caltables: &[(String, String)]) -> Result<()>;

    /// Per-antenna flagged-solution fraction in a calibration table, as
    /// `(antenna_id, flagged_fraction)` pairs. Used both for post-solve QA
    /// (spec §4.F step 8) and to downrank unhealthy reference antennas
    /// ahead of the next solve (step 4).
    async fn antenna_health(&self, table_path: &str) -> Result<Vec<(u32, f64)>>;
}

/// CLEAN imaging of a calibrated measurement set (spec §4.G Non-goal).
#[async_trait]
pub trait ExternalImager: Send + Sync {
    async fn image(&self, ms_path: &Path, output: &Path) -> Result<()>;
}

/// Mosaic combination of a window of images (spec §4.I Non-goal).
#[async_trait]
pub trait ExternalMosaicBuilder: Send + Sync {
    async fn build(&self, image_paths: &[&Path], output: &Path) -> Result<()>;
}

/// Sidereal transit time computation for a calibrator at a given
/// declination (spec §4.C Non-goal: the actual astrometry).
pub trait TransitTimeCalculator: Send + Sync {
    fn transit_time(&self, ra_deg: f64, observation_date: &str) -> DateTime<Utc>;
}

/// Builds the [`dsa110_model::ExecutionTask`] for the next stage in an
/// observation group's chain, given whatever the previous stage produced.
/// Resolving a group's actual shard/MS paths from the file index is
/// deployment-specific bookkeeping the worker loop delegates here, the same
/// way it delegates the scientific work itself to the `External*` traits
/// above (spec §4.D, §4.K).
#[async_trait]
pub trait GroupTaskBuilder: Send + Sync {
    async fn build_task(
        &self,
        group: &dsa110_model::ObservationGroup,
        stage_name: &str,
        previous: Option<&dsa110_model::ExecutionResult>,
    ) -> Result<dsa110_model::ExecutionTask>;
}
