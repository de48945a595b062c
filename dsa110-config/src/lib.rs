//! Hierarchical configuration for the continuum imaging pipeline: directory
//! layout, database paths, resource limits, feature toggles, and the
//! imaging/calibration knobs that tune the external numeric collaborators.
//!
//! Every config struct is `#[serde(deny_unknown_fields)]`, so a typo in a
//! TOML file fails loading instead of being silently ignored.

pub mod loader;
pub mod models;

pub use loader::{ConfigLoadError, ConfigLoader};
pub use models::{
    CalibrationConfig, DiskThresholds, ExecutionMode, FeatureToggles, ImagingConfig,
    PhotometryConfig, PipelineConfig, QualityTier, ResourceLimitsConfig, WriterKind,
    DEFAULT_OUTRIGGER_PRIORITY,
};
