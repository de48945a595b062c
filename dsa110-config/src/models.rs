use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// UVH5-to-MS writer implementation to use for conversion (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriterKind {
    Auto,
    DirectSubband,
    ParallelSubband,
}

impl Default for WriterKind {
    fn default() -> Self {
        Self::Auto
    }
}

/// Imaging depth, trading runtime for sensitivity (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Fast,
    Standard,
    Deep,
}

impl Default for QualityTier {
    fn default() -> Self {
        Self::Standard
    }
}

/// How a stage is run: in the worker process, as a child process, or chosen
/// automatically per resource limits (spec §6: `--execution-mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Inprocess,
    Subprocess,
    Auto,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Resource caps applied to stage execution (mirrors
/// `dsa110_model::ResourceLimits`, kept separate since this one is the
/// config-file shape before defaults are resolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub memory_mb: Option<u32>,
    pub cpu_seconds: Option<u32>,
    pub omp_threads: u32,
    pub mkl_threads: u32,
    pub max_workers: u32,
    pub use_cgroups: bool,
    pub timeout_seconds: u32,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            memory_mb: None,
            cpu_seconds: None,
            omp_threads: 4,
            mkl_threads: 4,
            max_workers: 4,
            use_cgroups: false,
            timeout_seconds: 600,
        }
    }
}

impl From<ResourceLimitsConfig> for dsa110_model::ResourceLimits {
    fn from(cfg: ResourceLimitsConfig) -> Self {
        dsa110_model::ResourceLimits {
            memory_mb: cfg.memory_mb,
            cpu_seconds: cfg.cpu_seconds,
            omp_threads: cfg.omp_threads,
            mkl_threads: cfg.mkl_threads,
            max_workers: cfg.max_workers,
            use_cgroups: cfg.use_cgroups,
            timeout_seconds: Some(cfg.timeout_seconds),
        }
    }
}

/// Which optional pipeline stages run after calibration/imaging
/// (spec §6: `--enable-*` flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub calibration_solving: bool,
    pub group_imaging: bool,
    pub mosaic_creation: bool,
    pub photometry: bool,
    pub auto_qa: bool,
    pub auto_publish: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            calibration_solving: true,
            group_imaging: true,
            mosaic_creation: true,
            photometry: true,
            auto_qa: false,
            auto_publish: false,
        }
    }
}

/// Imaging knobs passed to the external imager (spec §4.G).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub cell_arcsec: f64,
    pub robust: f64,
    pub niter: u32,
    pub threshold_jy: f64,
    pub pblimit: f64,
    pub quality_tier: QualityTier,
    pub use_unicat_mask: bool,
    pub mask_radius_arcsec: f64,
    pub mask_flux_threshold_jy: f64,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            cell_arcsec: 3.0,
            robust: 0.5,
            niter: 10_000,
            threshold_jy: 0.001,
            pblimit: -0.1,
            quality_tier: QualityTier::Standard,
            use_unicat_mask: true,
            mask_radius_arcsec: 60.0,
            mask_flux_threshold_jy: 0.05,
        }
    }
}

/// Cross-match and mosaic-window knobs for the photometry/mosaic stages
/// (spec §4.H-I).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    pub match_radius_arcsec: f64,
    pub mosaic_window_minutes: i64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            match_radius_arcsec: 5.0,
            mosaic_window_minutes: 120,
        }
    }
}

/// Disk-space watermarks polled by the worker loop (spec §5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskThresholds {
    pub warning_free_gb: f64,
    pub critical_free_gb: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            warning_free_gb: 200.0,
            critical_free_gb: 50.0,
        }
    }
}

/// Calibration solve/apply knobs (spec §4.F).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub bandpass_min_snr: f64,
    pub gain_solint_seconds: f64,
    pub gain_min_snr: f64,
    pub declination_change_threshold_deg: f64,
    pub refant_priority: Vec<u32>,
    pub refant_flagged_excellent: f64,
    pub refant_flagged_good: f64,
    pub refant_flagged_fair: f64,
    pub top_n_refants: usize,
}

/// Default priority order for outrigger reference antennas: eastern-first,
/// northern-next, peripheral-last.
pub const DEFAULT_OUTRIGGER_PRIORITY: [u32; 15] = [
    104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 103, 117,
];

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            bandpass_min_snr: 3.0,
            gain_solint_seconds: 60.0,
            gain_min_snr: 3.0,
            declination_change_threshold_deg: 0.1,
            refant_priority: DEFAULT_OUTRIGGER_PRIORITY.to_vec(),
            refant_flagged_excellent: 0.10,
            refant_flagged_good: 0.30,
            refant_flagged_fair: 0.50,
            top_n_refants: 5,
        }
    }
}

/// Top-level pipeline configuration, composed of the directory layout, the
/// queue/registry database paths, and the nested knob groups above
/// (spec §6, REDESIGN FLAGS: "explicit hierarchical config struct whose
/// recognized options are enumerated").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub index_db: PathBuf,
    pub queue_db: PathBuf,
    pub registry_db: PathBuf,
    pub products_db: PathBuf,
    pub data_registry_db: PathBuf,
    pub expected_subbands: u32,
    pub poll_interval_seconds: u64,
    pub worker_poll_interval_seconds: u64,
    pub execution_mode: ExecutionMode,
    pub writer: WriterKind,
    pub resource_limits: ResourceLimitsConfig,
    pub features: FeatureToggles,
    pub imaging: ImagingConfig,
    pub calibration: CalibrationConfig,
    pub photometry: PhotometryConfig,
    pub disk_thresholds: DiskThresholds,
    pub cal_fence_timeout_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("/data/incoming"),
            output_dir: PathBuf::from("/data/products"),
            scratch_dir: PathBuf::from("/data/scratch"),
            index_db: PathBuf::from("hdf5_file_index.sqlite3"),
            queue_db: PathBuf::from("queue.sqlite3"),
            registry_db: PathBuf::from("calibrator_registry.sqlite3"),
            products_db: PathBuf::from("products.sqlite3"),
            data_registry_db: PathBuf::from("data_registry.sqlite3"),
            expected_subbands: 16,
            poll_interval_seconds: 10,
            worker_poll_interval_seconds: 5,
            execution_mode: ExecutionMode::default(),
            writer: WriterKind::default(),
            resource_limits: ResourceLimitsConfig::default(),
            features: FeatureToggles::default(),
            imaging: ImagingConfig::default(),
            calibration: CalibrationConfig::default(),
            photometry: PhotometryConfig::default(),
            disk_thresholds: DiskThresholds::default(),
            cal_fence_timeout_seconds: 300,
        }
    }
}
