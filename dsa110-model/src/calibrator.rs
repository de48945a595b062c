use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A calibrator candidate pulled from a catalog (registered list, VLA, or
/// NVSS fallback) before it is registered for use (spec §3, §4.C).
///
/// `compactness` is a precomputed metric in `[0, 1]` (1 = unresolved point
/// source); the pipeline does not derive it from an angular size here, it
/// is carried from whichever catalog supplied the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorSource {
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub flux_jy: f64,
    pub spectral_index: Option<f64>,
    pub compactness: Option<f64>,
    pub catalog: String,
}

impl CalibratorSource {
    /// Quality score in 0-100, split flux (0-40) / spectral flatness (0-30) /
    /// compactness (0-30) (spec §4.C).
    pub fn quality_score(&self) -> f64 {
        flux_score(self.flux_jy) + spectral_flatness_score(self.spectral_index) + compactness_score(self.compactness)
    }
}

/// Flux component: saturates at 40 for flux >= 10 Jy, linear 20->40 between
/// 0.5 and 10 Jy, linear 0->20 below 0.5 Jy.
fn flux_score(flux_jy: f64) -> f64 {
    if flux_jy >= 10.0 {
        40.0
    } else if flux_jy >= 0.5 {
        20.0 + (flux_jy - 0.5) / (10.0 - 0.5) * 20.0
    } else {
        (flux_jy / 0.5 * 20.0).max(0.0)
    }
}

/// Spectral-index flatness: full credit below |a|=0.2, linear falloff to 20
/// at |a|=0.5, exponential decay thereafter; neutral 15 if unknown.
fn spectral_flatness_score(spectral_index: Option<f64>) -> f64 {
    match spectral_index {
        None => 15.0,
        Some(alpha) => {
            let abs_alpha = alpha.abs();
            if abs_alpha < 0.2 {
                30.0
            } else if abs_alpha <= 0.5 {
                30.0 - (abs_alpha - 0.2) / (0.5 - 0.2) * 10.0
            } else {
                20.0 * (-(abs_alpha - 0.5)).exp()
            }
        }
    }
}

/// Compactness component: linear in `[0, 1]`; neutral 15 if unknown.
fn compactness_score(compactness: Option<f64>) -> f64 {
    match compactness {
        None => 15.0,
        Some(c) => (c.clamp(0.0, 1.0)) * 30.0,
    }
}

/// Lifecycle status of a [`CalibratorRegistration`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Retired,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "retired" => Ok(Self::Retired),
            other => Err(format!("unknown registration status: {other}")),
        }
    }
}

/// A calibrator accepted for use by the pipeline, with its measured transit
/// time recorded for the given observing date and the declination strip it
/// is valid for (spec §3: "A registration is valid for declination `d` if
/// `dec_range_min <= d <= dec_range_max`").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorRegistration {
    pub source: CalibratorSource,
    pub observation_date: String,
    pub transit_time: DateTime<Utc>,
    pub quality_score: f64,
    pub dec_range_min: f64,
    pub dec_range_max: f64,
    pub status: RegistrationStatus,
    pub registered_by: String,
    pub notes: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl CalibratorRegistration {
    /// Whether this registration covers declination `d` (spec §3).
    pub fn covers_declination(&self, d: f64) -> bool {
        self.dec_range_min <= d && d <= self.dec_range_max
    }
}

/// A calibrator excluded from auto-selection, either by name or by a
/// coordinate cone around a previously bad position (spec §4.C).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorBlacklistEntry {
    pub name: Option<String>,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub radius_deg: f64,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
}

impl CalibratorBlacklistEntry {
    /// Default cone radius applied to coordinate-based blacklist entries.
    pub const DEFAULT_RADIUS_DEG: f64 = 0.01;

    /// Whether `source` is excluded by this entry: exact name match, or
    /// falling inside the coordinate cone.
    pub fn excludes(&self, source: &CalibratorSource) -> bool {
        if let Some(name) = &self.name {
            if name == &source.name {
                return true;
            }
        }
        if let (Some(ra), Some(dec)) = (self.ra_deg, self.dec_deg) {
            let dra = (ra - source.ra_deg) * source.dec_deg.to_radians().cos();
            let ddec = dec - source.dec_deg;
            let separation = (dra * dra + ddec * ddec).sqrt();
            if separation <= self.radius_deg {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(flux_jy: f64, spectral_index: Option<f64>, compactness: Option<f64>) -> CalibratorSource {
        CalibratorSource {
            name: "test".to_string(),
            ra_deg: 180.0,
            dec_deg: 20.0,
            flux_jy,
            spectral_index,
            compactness,
            catalog: "nvss".to_string(),
        }
    }

    #[test]
    fn bright_flat_compact_source_scores_near_maximum() {
        let s = source(15.0, Some(0.0), Some(1.0));
        assert_eq!(s.quality_score(), 100.0);
    }

    #[test]
    fn dim_source_scores_low_on_flux() {
        let s = source(0.1, Some(0.0), Some(1.0));
        assert!(s.quality_score() < 70.0);
    }

    #[test]
    fn missing_optional_fields_get_neutral_scores() {
        let s = source(10.0, None, None);
        assert_eq!(s.quality_score(), 40.0 + 15.0 + 15.0);
    }

    #[test]
    fn steep_spectrum_scores_lower_than_flat() {
        let flat = source(10.0, Some(0.1), Some(1.0));
        let steep = source(10.0, Some(0.8), Some(1.0));
        assert!(flat.quality_score() > steep.quality_score());
    }
}
