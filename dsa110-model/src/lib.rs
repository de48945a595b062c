//! Shared data models for the DSA-110 continuum imaging pipeline.
//!
//! Every struct here is a plain, serializable entity from the pipeline's
//! data model: file index rows, observation groups, calibration artifacts,
//! photometry measurements, transient candidates, and registry rows. None
//! of these types own a database connection; persistence lives in
//! `dsa110-core`.

pub mod calibrator;
pub mod data_registry;
pub mod execution;
pub mod index;
pub mod mosaic;
pub mod ms;
pub mod photometry;
pub mod queue;
pub mod transient;

pub use calibrator::{CalibratorBlacklistEntry, CalibratorRegistration, CalibratorSource};
pub use data_registry::{DataRecord, DataRelationship, FinalizationStatus, PublishMode};
pub use execution::{ExecutionMetrics, ExecutionResult, ExecutionTask, ResourceLimits};
pub use index::IndexedFile;
pub use mosaic::{MosaicGroup, MosaicMembership, MosaicStatus};
pub use ms::{MsRecord, ProcessingStage};
pub use photometry::PhotometryMeasurement;
pub use queue::{ObservationGroup, ObservationGroupState};
pub use transient::{AlertLevel, DetectionType, TransientAlert, TransientCandidate};
