//! Core pipeline logic for the DSA-110 continuum imaging pipeline: file
//! indexing, subband grouping, the calibrator registry, the stage
//! framework (conversion, calibration, imaging), photometry/cross-match/
//! variability, mosaic triggering, the data registry, and the worker
//! loop that drives it all (spec §4).

pub mod calibrator;
pub mod crossmatch;
pub mod data_registry;
pub mod db;
pub mod filename;
pub mod index;
pub mod mosaic;
pub mod products;
pub mod queue;
pub mod refant;
pub mod stages;
pub mod variability;
pub mod worker;

pub use calibrator::CalibratorRegistryRepository;
pub use crossmatch::{
    bulk_statistics, crossmatch, deduplicate_catalogs, multi_catalog_match, CatalogEntry,
    MatchRow, MatchStatistics, SkyPosition,
};
pub use data_registry::DataRegistryRepository;
pub use db::Databases;
pub use filename::{derive_group_id, parse_shard_filename, ShardName};
pub use index::FileIndexRepository;
pub use mosaic::{ImagedMs, MosaicTrigger};
pub use products::ProductsRepository;
pub use queue::{fifo_order, QueueRepository};
pub use refant::{default_refant_string, health_status, recommend_refants, AntennaHealth, HealthStatus};
pub use stages::calibration::{CalibrationApplyStage, CalibrationSolveStage};
pub use stages::conversion::ConversionStage;
pub use stages::imaging::ImagingStage;
pub use stages::mosaic::MosaicStage;
pub use stages::photometry::PhotometryStage;
pub use variability::{
    alert_level, build_candidate, classify_detection, is_fading_reference, Classification,
    DetectedSource, Source, UnmatchedCatalogSource, VariabilityMetrics,
};
pub use worker::{DiskMonitor, GroupOutcome, WorkerLoop};
