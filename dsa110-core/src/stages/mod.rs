//! Pipeline stages (spec §4.D-I): conversion, calibration solve/apply,
//! imaging, photometry, and mosaic triggering, each a
//! [`dsa110_contracts::stage::Stage`] implementation driving the
//! corresponding external collaborator trait.

pub mod calibration;
pub mod conversion;
pub mod imaging;
pub mod mosaic;
pub mod photometry;

pub use calibration::{CalibrationApplyStage, CalibrationSolveStage};
pub use conversion::ConversionStage;
pub use imaging::ImagingStage;
pub use mosaic::MosaicStage;
pub use photometry::PhotometryStage;
