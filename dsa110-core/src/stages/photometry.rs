use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dsa110_config::PhotometryConfig;
use dsa110_contracts::error::Result;
use dsa110_contracts::repository::ProductsPort;
use dsa110_contracts::stage::{PipelineContext, Stage};
use dsa110_model::{ExecutionMetrics, ExecutionResult, PhotometryMeasurement};

use crate::crossmatch::{crossmatch, SkyPosition};
use crate::variability::{
    alert_level, build_candidate, classify_detection, DetectedSource, Source,
    DEFAULT_NEW_SOURCE_SIGMA, FADING_REFERENCE_MIN_FLUX_JY,
};

/// One row of the detected-source table this stage consumes: the actual
/// source extraction is an external collaborator (spec §4.G Non-goal), so
/// this stage is fed the table via `ctx.task.params` the same way
/// [`crate::stages::imaging::ImagingStage`] is fed `nearby_sources`.
struct Row {
    name: String,
    ra_deg: f64,
    dec_deg: f64,
    flux_jy: f64,
    flux_err_jy: f64,
}

/// Cross-matches a mosaic's detected sources against a baseline catalog,
/// classifies new/variable/fading-reference candidates, and records
/// transients and alerts (spec §4.H).
pub struct PhotometryStage {
    products: Arc<dyn ProductsPort>,
    config: PhotometryConfig,
}

impl PhotometryStage {
    pub fn new(products: Arc<dyn ProductsPort>, config: PhotometryConfig) -> Self {
        Self { products, config }
    }
}

fn parse_rows(raw: Option<&String>) -> Vec<Row> {
    let Some(raw) = raw else { return Vec::new() };
    raw.split(';')
        .filter_map(|entry| {
            let mut parts = entry.split(',');
            let name = parts.next()?.to_string();
            let ra_deg: f64 = parts.next()?.parse().ok()?;
            let dec_deg: f64 = parts.next()?.parse().ok()?;
            let flux_jy: f64 = parts.next()?.parse().ok()?;
            let flux_err_jy: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
            Some(Row { name, ra_deg, dec_deg, flux_jy, flux_err_jy })
        })
        .collect()
}

#[async_trait]
impl Stage for PhotometryStage {
    fn name(&self) -> &str {
        "photometry"
    }

    async fn validate(&self, _ctx: &PipelineContext) -> (bool, Option<String>) {
        // An empty detected-source table is a legitimate no-op (e.g. a
        // mosaic with no catalog to cross-match against yet), not a
        // validation failure.
        (true, None)
    }

    async fn execute(&self, ctx: PipelineContext) -> Result<ExecutionResult> {
        let started = Instant::now();
        let detected = parse_rows(ctx.task.params.get("detected_sources"));
        let catalog = parse_rows(ctx.task.params.get("catalog_sources"));

        let detected_positions: Vec<SkyPosition> = detected
            .iter()
            .map(|r| SkyPosition { ra_deg: r.ra_deg, dec_deg: r.dec_deg, flux_jy: Some(r.flux_jy) })
            .collect();
        let catalog_positions: Vec<SkyPosition> = catalog
            .iter()
            .map(|r| SkyPosition { ra_deg: r.ra_deg, dec_deg: r.dec_deg, flux_jy: Some(r.flux_jy) })
            .collect();

        let matches = crossmatch(&detected_positions, &catalog_positions, self.config.match_radius_arcsec);
        let matched_catalog: std::collections::HashSet<usize> =
            matches.iter().map(|m| m.idx_catalog).collect();
        let catalog_match_for: HashMap<usize, f64> =
            matches.iter().map(|m| (m.idx_detected, catalog[m.idx_catalog].flux_jy)).collect();

        let now = Utc::now();
        let mut candidates_recorded = 0u32;
        let mut alerts_raised = 0u32;

        if !detected.is_empty() {
            let measurements: Vec<PhotometryMeasurement> = detected
                .iter()
                .map(|r| PhotometryMeasurement {
                    source_name: r.name.clone(),
                    catalog: "nvss".to_string(),
                    ra_deg: r.ra_deg,
                    dec_deg: r.dec_deg,
                    mosaic_id: ctx.task.group_id.clone(),
                    flux_jy: r.flux_jy,
                    flux_err_jy: r.flux_err_jy,
                    observed_at: now,
                })
                .collect();
            self.products.insert_photometry(&measurements).await?;
        }

        for (idx, row) in detected.iter().enumerate() {
            let source = DetectedSource {
                flux_jy: row.flux_jy,
                flux_err_jy: row.flux_err_jy,
                catalog_match: catalog_match_for.get(&idx).copied(),
            };
            let Some(classification) = classify_detection(&source) else { continue };

            let history = self.products.photometry_history(&row.name).await?;
            let metrics = Source::new(&history).calc_variability_metrics();
            let mean_flux_jy = if history.is_empty() {
                row.flux_jy
            } else {
                (history.iter().map(|m| m.flux_jy).sum::<f64>() + row.flux_jy) / (history.len() + 1) as f64
            };

            let candidate = build_candidate(
                &row.name,
                row.ra_deg,
                row.dec_deg,
                classification,
                metrics,
                mean_flux_jy,
                now,
                now,
            );
            self.products.upsert_transient(&candidate).await?;
            candidates_recorded += 1;

            if let Some(level) = alert_level(classification.detection_type, classification.sigma) {
                let verb = match classification.detection_type {
                    dsa110_model::DetectionType::New => "detected",
                    dsa110_model::DetectionType::Brightening => "brightened",
                    dsa110_model::DetectionType::Fading => "faded",
                    dsa110_model::DetectionType::Variable => "varied",
                };
                let baseline_mjy = catalog_match_for.get(&idx).copied().unwrap_or(0.0) * 1000.0;
                let observed_mjy = row.flux_jy * 1000.0;
                let ratio = if baseline_mjy > 0.0 { observed_mjy / baseline_mjy } else { f64::INFINITY };
                let message = if catalog_match_for.contains_key(&idx) {
                    format!(
                        "{verb} from {baseline_mjy:.1} to {observed_mjy:.1} mJy ({ratio:.2}\u{d7}, {:.1}\u{3c3})",
                        classification.sigma
                    )
                } else {
                    format!("{verb} at {observed_mjy:.1} mJy ({:.1}\u{3c3})", classification.sigma)
                };
                self.products
                    .record_alert(&dsa110_model::TransientAlert {
                        candidate: candidate.clone(),
                        level,
                        raised_at: now,
                        message,
                    })
                    .await?;
                alerts_raised += 1;
            }
        }

        // Fading-reference: catalog sources with no detected counterpart,
        // reusing classify_detection with a zero observed flux and the
        // noise floor implied by the minimum reportable new-source flux
        // (spec §4.H: "catalog sources >= 10 mJy with no detected
        // counterpart").
        let assumed_noise_jy = FADING_REFERENCE_MIN_FLUX_JY / DEFAULT_NEW_SOURCE_SIGMA;
        for (idx, row) in catalog.iter().enumerate() {
            if matched_catalog.contains(&idx) || row.flux_jy < FADING_REFERENCE_MIN_FLUX_JY {
                continue;
            }
            let source = DetectedSource {
                flux_jy: 0.0,
                flux_err_jy: assumed_noise_jy,
                catalog_match: Some(row.flux_jy),
            };
            let Some(classification) = classify_detection(&source) else { continue };
            let candidate = build_candidate(
                &row.name,
                row.ra_deg,
                row.dec_deg,
                classification,
                Default::default(),
                0.0,
                now,
                now,
            );
            self.products.upsert_transient(&candidate).await?;
            candidates_recorded += 1;

            if let Some(level) = alert_level(classification.detection_type, classification.sigma) {
                let baseline_mjy = row.flux_jy * 1000.0;
                let message = format!(
                    "faded from {baseline_mjy:.1} to 0.0 mJy (0.00\u{d7}, {:.1}\u{3c3})",
                    classification.sigma
                );
                self.products
                    .record_alert(&dsa110_model::TransientAlert { candidate, level, raised_at: now, message })
                    .await?;
                alerts_raised += 1;
            }
        }

        let mut derived = HashMap::new();
        derived.insert("candidates_recorded".to_string(), candidates_recorded.to_string());
        derived.insert("alerts_raised".to_string(), alerts_raised.to_string());

        Ok(ExecutionResult {
            task_id: ctx.task.task_id.clone(),
            success: true,
            error_code: Some(0),
            error_message: None,
            metrics: ExecutionMetrics {
                total_time_s: started.elapsed().as_secs_f64(),
                files_processed: detected.len() as u32,
                return_code: Some(0),
                ..Default::default()
            },
            output_path: None,
            derived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsa110_model::{ExecutionTask, ResourceLimits, TransientAlert, TransientCandidate};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubProducts {
        alerts: Mutex<Vec<TransientAlert>>,
        candidates: Mutex<Vec<TransientCandidate>>,
    }

    #[async_trait]
    impl ProductsPort for StubProducts {
        async fn upsert_ms(&self, _record: &dsa110_model::MsRecord) -> Result<()> {
            Ok(())
        }
        async fn get_ms(&self, _ms_path: &str) -> Result<Option<dsa110_model::MsRecord>> {
            Ok(None)
        }
        async fn insert_photometry(&self, _measurements: &[PhotometryMeasurement]) -> Result<()> {
            Ok(())
        }
        async fn photometry_history(&self, _source_name: &str) -> Result<Vec<PhotometryMeasurement>> {
            Ok(Vec::new())
        }
        async fn upsert_transient(&self, candidate: &TransientCandidate) -> Result<()> {
            self.candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }
        async fn record_alert(&self, alert: &TransientAlert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
        async fn upsert_mosaic(&self, _mosaic: &dsa110_model::MosaicGroup) -> Result<()> {
            Ok(())
        }
        async fn add_mosaic_member(&self, _membership: &dsa110_model::MosaicMembership) -> Result<()> {
            Ok(())
        }
    }

    fn task(params: HashMap<String, String>) -> ExecutionTask {
        ExecutionTask {
            task_id: "phot-1".to_string(),
            stage_name: "photometry".to_string(),
            group_id: "g1".to_string(),
            input_paths: Vec::new(),
            output_path: None,
            params,
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn brightening_detection_raises_high_alert() {
        let products = Arc::new(StubProducts::default());
        let stage = PhotometryStage::new(products.clone(), PhotometryConfig::default());
        let mut params = HashMap::new();
        params.insert("detected_sources".to_string(), "src1,100.5,25.3,0.050,0.002".to_string());
        params.insert("catalog_sources".to_string(), "src1,100.5,25.3,0.025".to_string());
        let ctx = PipelineContext {
            task: task(params),
            run_as_subprocess: false,
            workdir: std::env::temp_dir(),
        };
        let result = stage.execute(ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.derived.get("candidates_recorded").unwrap(), "1");
        assert_eq!(result.derived.get("alerts_raised").unwrap(), "1");
        let alerts = products.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, dsa110_model::AlertLevel::High);
        assert_eq!(alerts[0].message, "brightened from 25.0 to 50.0 mJy (2.00\u{d7}, 10.6\u{3c3})");
    }

    #[tokio::test]
    async fn missing_bright_catalog_source_is_a_fading_reference() {
        let products = Arc::new(StubProducts::default());
        let stage = PhotometryStage::new(products.clone(), PhotometryConfig::default());
        let mut params = HashMap::new();
        params.insert("catalog_sources".to_string(), "src2,10.0,5.0,0.100".to_string());
        let ctx = PipelineContext {
            task: task(params),
            run_as_subprocess: false,
            workdir: std::env::temp_dir(),
        };
        let result = stage.execute(ctx).await.unwrap();
        assert_eq!(result.derived.get("candidates_recorded").unwrap(), "1");
        let candidates = products.candidates.lock().unwrap();
        assert_eq!(candidates[0].detection_type, dsa110_model::DetectionType::Fading);
    }

    #[tokio::test]
    async fn empty_tables_are_a_no_op() {
        let products = Arc::new(StubProducts::default());
        let stage = PhotometryStage::new(products.clone(), PhotometryConfig::default());
        let ctx = PipelineContext {
            task: task(HashMap::new()),
            run_as_subprocess: false,
            workdir: std::env::temp_dir(),
        };
        let result = stage.execute(ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.derived.get("candidates_recorded").unwrap(), "0");
    }
}
