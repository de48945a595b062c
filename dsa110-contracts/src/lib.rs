//! Trait surfaces and canonical error taxonomy shared across the pipeline
//! crates: the [`stage::Stage`] contract every processing step implements,
//! the repository ports persistence adapters satisfy, and the narrow
//! external-collaborator traits standing in for numeric routines outside
//! this crate's scope.

pub mod error;
pub mod external;
pub mod repository;
pub mod stage;

pub mod prelude {
    pub use crate::error::{ErrorCode, PipelineError, Result};
    pub use crate::external::{
        ExternalCalibrationEngine, ExternalConverter, ExternalImager, ExternalMosaicBuilder,
        TransitTimeCalculator,
    };
    pub use crate::repository::{
        CalibratorRegistryPort, DataRegistryPort, FileIndexPort, ProductsPort, QueuePort,
    };
    pub use crate::stage::{PipelineContext, Stage};
}
