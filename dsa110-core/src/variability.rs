use chrono::{DateTime, Utc};
use dsa110_model::{AlertLevel, DetectionType, PhotometryMeasurement, TransientCandidate};

/// Per-source variability statistics computed over a lightcurve (spec
/// §4.H `Source.calc_variability_metrics`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VariabilityMetrics {
    /// Coefficient of variation: `std(flux) / mean(flux)`.
    pub v: f64,
    /// Weighted-variance metric, flux weighted by inverse error squared.
    pub eta: f64,
    /// Mean of pairwise two-epoch t-statistics.
    pub vs_mean: f64,
    /// Mean of pairwise modulation indices.
    pub m_mean: f64,
}

/// A source's detections aggregated from the products store, exposing
/// epoch counts and variability metrics (spec §4.H `Source` object).
pub struct Source<'a> {
    measurements: &'a [PhotometryMeasurement],
}

/// SNR proxy threshold above which a measurement counts as a detection.
const DETECTION_SNR_THRESHOLD: f64 = 5.0;

impl<'a> Source<'a> {
    pub fn new(measurements: &'a [PhotometryMeasurement]) -> Self {
        Self { measurements }
    }

    pub fn n_epochs(&self) -> usize {
        self.measurements.len()
    }

    pub fn detections(&self) -> usize {
        self.measurements
            .iter()
            .filter(|m| m.flux_err_jy > 0.0 && m.flux_jy / m.flux_err_jy >= DETECTION_SNR_THRESHOLD)
            .count()
    }

    pub fn calc_variability_metrics(&self) -> VariabilityMetrics {
        let n = self.measurements.len();
        if n < 2 {
            return VariabilityMetrics::default();
        }

        let fluxes: Vec<f64> = self.measurements.iter().map(|m| m.flux_jy).collect();
        let mean = fluxes.iter().sum::<f64>() / n as f64;
        let variance = fluxes.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt();
        let v = if mean != 0.0 { std / mean } else { 0.0 };

        let weights: Vec<f64> = self
            .measurements
            .iter()
            .map(|m| if m.flux_err_jy > 0.0 { 1.0 / (m.flux_err_jy * m.flux_err_jy) } else { 0.0 })
            .collect();
        let weight_sum: f64 = weights.iter().sum();
        let eta = if weight_sum > 0.0 {
            let weighted_mean =
                fluxes.iter().zip(&weights).map(|(f, w)| f * w).sum::<f64>() / weight_sum;
            fluxes
                .iter()
                .zip(&weights)
                .map(|(f, w)| w * (f - weighted_mean).powi(2))
                .sum::<f64>()
                / weight_sum
        } else {
            0.0
        };

        let mut vs_sum = 0.0;
        let mut m_sum = 0.0;
        let mut pairs = 0u32;
        for i in 0..n {
            for j in (i + 1)..n {
                let (f1, e1) = (fluxes[i], self.measurements[i].flux_err_jy);
                let (f2, e2) = (fluxes[j], self.measurements[j].flux_err_jy);
                let combined_err = (e1 * e1 + e2 * e2).sqrt();
                if combined_err > 0.0 {
                    vs_sum += (f1 - f2).abs() / combined_err;
                }
                let flux_sum = f1 + f2;
                if flux_sum != 0.0 {
                    m_sum += 2.0 * (f1 - f2).abs() / flux_sum;
                }
                pairs += 1;
            }
        }
        let (vs_mean, m_mean) = if pairs > 0 {
            (vs_sum / pairs as f64, m_sum / pairs as f64)
        } else {
            (0.0, 0.0)
        };

        VariabilityMetrics { v, eta, vs_mean, m_mean }
    }
}

/// One detected source in a mosaic's photometry, paired against a baseline
/// catalog entry if one exists within the match radius (spec §4.H
/// transient detection inputs).
#[derive(Debug, Clone, Copy)]
pub struct DetectedSource {
    pub flux_jy: f64,
    pub flux_err_jy: f64,
    /// `flux_jy` of the baseline catalog counterpart, if a cross-match
    /// found one within radius.
    pub catalog_match: Option<f64>,
}

/// A baseline catalog source with no detected counterpart in this mosaic,
/// input to the *fading-reference* classification.
#[derive(Debug, Clone, Copy)]
pub struct UnmatchedCatalogSource {
    pub flux_jy: f64,
}

/// Default sigma threshold for a *new* detection to be reported (spec
/// §4.H: "flux/error >= 5 sigma (default)").
pub const DEFAULT_NEW_SOURCE_SIGMA: f64 = 5.0;
/// Flux ratio above which a variable match is classified brightening.
pub const BRIGHTENING_RATIO: f64 = 1.5;
/// Flux ratio below which a variable match is classified fading.
pub const FADING_RATIO: f64 = 0.67;
/// Sigma threshold for a matched source's flux difference to be flagged.
pub const VARIABLE_SIGMA_THRESHOLD: f64 = 3.0;
/// Fractional baseline-flux uncertainty folded into the combined sigma for
/// matched-source variability (spec §4.H: "detection error + 5% baseline").
pub const BASELINE_FRACTIONAL_ERROR: f64 = 0.05;
/// Minimum baseline flux for an unmatched catalog source to be reported as
/// a fading reference (spec §4.H: ">= 10 mJy").
pub const FADING_REFERENCE_MIN_FLUX_JY: f64 = 0.010;

/// A transient candidate plus the significance (in sigma) that drove its
/// classification, before an alert level is assigned.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub detection_type: DetectionType,
    pub sigma: f64,
}

/// Classify one detected source against its (optional) catalog match,
/// returning `None` if it's neither new nor variable enough to report
/// (spec §4.H transient detection: new / variable / fading-reference).
pub fn classify_detection(source: &DetectedSource) -> Option<Classification> {
    match source.catalog_match {
        None => {
            if source.flux_err_jy <= 0.0 {
                return None;
            }
            let sigma = source.flux_jy / source.flux_err_jy;
            if sigma >= DEFAULT_NEW_SOURCE_SIGMA {
                Some(Classification { detection_type: DetectionType::New, sigma })
            } else {
                None
            }
        }
        Some(catalog_flux) => {
            let combined_err = (source.flux_err_jy.powi(2)
                + (catalog_flux * BASELINE_FRACTIONAL_ERROR).powi(2))
            .sqrt();
            if combined_err <= 0.0 {
                return None;
            }
            let diff = source.flux_jy - catalog_flux;
            let sigma = diff.abs() / combined_err;
            if sigma < VARIABLE_SIGMA_THRESHOLD {
                return None;
            }
            let flux_ratio = if catalog_flux != 0.0 {
                source.flux_jy / catalog_flux
            } else {
                f64::INFINITY
            };
            let detection_type = if flux_ratio > BRIGHTENING_RATIO {
                DetectionType::Brightening
            } else if flux_ratio < FADING_RATIO {
                DetectionType::Fading
            } else {
                DetectionType::Variable
            };
            Some(Classification { detection_type, sigma })
        }
    }
}

/// Whether an unmatched catalog source qualifies as a fading reference
/// (spec §4.H: "catalog sources >= 10 mJy that have no detected
/// counterpart").
pub fn is_fading_reference(source: &UnmatchedCatalogSource) -> bool {
    source.flux_jy >= FADING_REFERENCE_MIN_FLUX_JY
}

/// Alert level for a classified candidate, or `None` if it doesn't cross
/// any alerting threshold (spec §4.H alert levels).
pub fn alert_level(detection_type: DetectionType, sigma: f64) -> Option<AlertLevel> {
    if detection_type == DetectionType::New && sigma >= 10.0 {
        return Some(AlertLevel::Critical);
    }
    if sigma >= 7.0
        && matches!(
            detection_type,
            DetectionType::New | DetectionType::Brightening | DetectionType::Fading
        )
    {
        return Some(AlertLevel::High);
    }
    if (5.0..7.0).contains(&sigma) {
        return Some(AlertLevel::Medium);
    }
    None
}

/// Build the candidate row recorded to `transient_candidates` for a
/// classified detection.
pub fn build_candidate(
    source_name: &str,
    ra_deg: f64,
    dec_deg: f64,
    classification: Classification,
    metrics: VariabilityMetrics,
    mean_flux_jy: f64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
) -> TransientCandidate {
    TransientCandidate {
        source_name: source_name.to_string(),
        ra_deg,
        dec_deg,
        detection_type: classification.detection_type,
        variability_index: metrics.v,
        chi_squared_eta: metrics.eta,
        mean_flux_jy,
        modulation_index: metrics.m_mean,
        first_seen,
        last_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(flux: f64, err: f64) -> PhotometryMeasurement {
        PhotometryMeasurement {
            source_name: "src".to_string(),
            catalog: "nvss".to_string(),
            ra_deg: 180.0,
            dec_deg: 20.0,
            mosaic_id: "m1".to_string(),
            flux_jy: flux,
            flux_err_jy: err,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn steady_source_has_low_variability() {
        let measurements = vec![measurement(1.0, 0.1), measurement(1.01, 0.1), measurement(0.99, 0.1)];
        let metrics = Source::new(&measurements).calc_variability_metrics();
        assert!(metrics.v < 0.1);
    }

    #[test]
    fn new_source_above_5_sigma_is_classified_new() {
        let source = DetectedSource { flux_jy: 0.06, flux_err_jy: 0.01, catalog_match: None };
        let c = classify_detection(&source).unwrap();
        assert_eq!(c.detection_type, DetectionType::New);
        assert!(c.sigma >= 5.0);
    }

    #[test]
    fn brightening_match_is_classified_brightening() {
        let source = DetectedSource {
            flux_jy: 0.2,
            flux_err_jy: 0.005,
            catalog_match: Some(0.1),
        };
        let c = classify_detection(&source).unwrap();
        assert_eq!(c.detection_type, DetectionType::Brightening);
    }

    #[test]
    fn brightening_scenario_matches_worked_example() {
        // 50 mJy detection against a 25 mJy NVSS baseline, 2 mJy detection
        // error: combined sigma ~= 2.36 mJy, significance ~= 10.6 sigma.
        let source = DetectedSource {
            flux_jy: 0.050,
            flux_err_jy: 0.002,
            catalog_match: Some(0.025),
        };
        let c = classify_detection(&source).unwrap();
        assert_eq!(c.detection_type, DetectionType::Brightening);
        assert!((c.sigma - 10.6).abs() < 0.05, "sigma was {}", c.sigma);
        assert_eq!(alert_level(c.detection_type, c.sigma), Some(AlertLevel::High));
    }

    #[test]
    fn fading_reference_requires_10_mjy() {
        assert!(is_fading_reference(&UnmatchedCatalogSource { flux_jy: 0.011 }));
        assert!(!is_fading_reference(&UnmatchedCatalogSource { flux_jy: 0.005 }));
    }

    #[test]
    fn alert_levels_match_sigma_thresholds() {
        assert_eq!(alert_level(DetectionType::New, 12.0), Some(AlertLevel::Critical));
        assert_eq!(alert_level(DetectionType::Brightening, 8.0), Some(AlertLevel::High));
        assert_eq!(alert_level(DetectionType::Variable, 6.0), Some(AlertLevel::Medium));
        assert_eq!(alert_level(DetectionType::Variable, 8.0), None);
    }
}
