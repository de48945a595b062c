use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsa110_contracts::error::Result;
use dsa110_contracts::repository::ProductsPort;
use dsa110_model::{
    AlertLevel, DetectionType, MosaicGroup, MosaicMembership, MosaicStatus, MsRecord,
    PhotometryMeasurement, ProcessingStage, TransientAlert, TransientCandidate,
};
use sqlx::{Row, SqlitePool};

/// Products database repository: measurement sets, photometry, and
/// transient candidates/alerts (spec §4.D-H).
#[derive(Clone)]
pub struct ProductsRepository {
    pool: SqlitePool,
}

impl ProductsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn stage_str(stage: ProcessingStage) -> &'static str {
    match stage {
        ProcessingStage::Converted => "converted",
        ProcessingStage::CalibrationSolved => "calibration_solved",
        ProcessingStage::CalibrationApplied => "calibration_applied",
        ProcessingStage::Imaged => "imaged",
        ProcessingStage::Mosaicked => "mosaicked",
    }
}

fn parse_stage(s: &str) -> ProcessingStage {
    match s {
        "calibration_solved" => ProcessingStage::CalibrationSolved,
        "calibration_applied" => ProcessingStage::CalibrationApplied,
        "imaged" => ProcessingStage::Imaged,
        "mosaicked" => ProcessingStage::Mosaicked,
        _ => ProcessingStage::Converted,
    }
}

fn detection_type_str(d: DetectionType) -> &'static str {
    match d {
        DetectionType::New => "new",
        DetectionType::Brightening => "brightening",
        DetectionType::Fading => "fading",
        DetectionType::Variable => "variable",
    }
}

fn parse_detection_type(s: &str) -> DetectionType {
    match s {
        "brightening" => DetectionType::Brightening,
        "fading" => DetectionType::Fading,
        "variable" => DetectionType::Variable,
        _ => DetectionType::New,
    }
}

fn alert_level_str(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Medium => "MEDIUM",
        AlertLevel::High => "HIGH",
        AlertLevel::Critical => "CRITICAL",
    }
}

fn mosaic_status_str(status: MosaicStatus) -> &'static str {
    match status {
        MosaicStatus::Collecting => "collecting",
        MosaicStatus::Ready => "ready",
        MosaicStatus::Building => "building",
        MosaicStatus::Completed => "completed",
        MosaicStatus::Failed => "failed",
    }
}

fn parse_mosaic_status(s: &str) -> MosaicStatus {
    match s {
        "ready" => MosaicStatus::Ready,
        "building" => MosaicStatus::Building,
        "completed" => MosaicStatus::Completed,
        "failed" => MosaicStatus::Failed,
        _ => MosaicStatus::Collecting,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ProductsPort for ProductsRepository {
    async fn upsert_ms(&self, record: &MsRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ms_records
                (ms_path, group_id, stage, calibrator_name, image_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(ms_path) DO UPDATE SET
                stage = excluded.stage,
                calibrator_name = excluded.calibrator_name,
                image_path = excluded.image_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.ms_path)
        .bind(&record.group_id)
        .bind(stage_str(record.stage))
        .bind(&record.calibrator_name)
        .bind(&record.image_path)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ms(&self, ms_path: &str) -> Result<Option<MsRecord>> {
        let row = sqlx::query(
            r#"SELECT ms_path, group_id, stage, calibrator_name, image_path, created_at, updated_at
               FROM ms_records WHERE ms_path = ?1"#,
        )
        .bind(ms_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| MsRecord {
            ms_path: r.get("ms_path"),
            group_id: r.get("group_id"),
            stage: parse_stage(&r.get::<String, _>("stage")),
            calibrator_name: r.get("calibrator_name"),
            image_path: r.get("image_path"),
            created_at: parse_rfc3339(&r.get::<String, _>("created_at")),
            updated_at: parse_rfc3339(&r.get::<String, _>("updated_at")),
        }))
    }

    async fn insert_photometry(&self, measurements: &[PhotometryMeasurement]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for m in measurements {
            sqlx::query(
                r#"
                INSERT INTO photometry_measurements
                    (source_name, catalog, ra_deg, dec_deg, mosaic_id, flux_jy, flux_err_jy, observed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&m.source_name)
            .bind(&m.catalog)
            .bind(m.ra_deg)
            .bind(m.dec_deg)
            .bind(&m.mosaic_id)
            .bind(m.flux_jy)
            .bind(m.flux_err_jy)
            .bind(m.observed_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn photometry_history(&self, source_name: &str) -> Result<Vec<PhotometryMeasurement>> {
        let rows = sqlx::query(
            r#"SELECT source_name, catalog, ra_deg, dec_deg, mosaic_id, flux_jy, flux_err_jy, observed_at
               FROM photometry_measurements
               WHERE source_name = ?1
               ORDER BY observed_at ASC"#,
        )
        .bind(source_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PhotometryMeasurement {
                source_name: r.get("source_name"),
                catalog: r.get("catalog"),
                ra_deg: r.get("ra_deg"),
                dec_deg: r.get("dec_deg"),
                mosaic_id: r.get("mosaic_id"),
                flux_jy: r.get("flux_jy"),
                flux_err_jy: r.get("flux_err_jy"),
                observed_at: parse_rfc3339(&r.get::<String, _>("observed_at")),
            })
            .collect())
    }

    async fn upsert_transient(&self, candidate: &TransientCandidate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transient_candidates
                (source_name, ra_deg, dec_deg, detection_type, variability_index,
                 chi_squared_eta, mean_flux_jy, modulation_index, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(source_name) DO UPDATE SET
                detection_type = excluded.detection_type,
                variability_index = excluded.variability_index,
                chi_squared_eta = excluded.chi_squared_eta,
                mean_flux_jy = excluded.mean_flux_jy,
                modulation_index = excluded.modulation_index,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&candidate.source_name)
        .bind(candidate.ra_deg)
        .bind(candidate.dec_deg)
        .bind(detection_type_str(candidate.detection_type))
        .bind(candidate.variability_index)
        .bind(candidate.chi_squared_eta)
        .bind(candidate.mean_flux_jy)
        .bind(candidate.modulation_index)
        .bind(candidate.first_seen.to_rfc3339())
        .bind(candidate.last_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_alert(&self, alert: &TransientAlert) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO transient_alerts (source_name, level, raised_at, message)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(&alert.candidate.source_name)
        .bind(alert_level_str(alert.level))
        .bind(alert.raised_at.to_rfc3339())
        .bind(&alert.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_mosaic(&self, mosaic: &MosaicGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mosaic_groups
                (mosaic_id, status, window_start, window_end, output_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(mosaic_id) DO UPDATE SET
                status = excluded.status,
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                output_path = excluded.output_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&mosaic.mosaic_id)
        .bind(mosaic_status_str(mosaic.status))
        .bind(mosaic.window_start.to_rfc3339())
        .bind(mosaic.window_end.to_rfc3339())
        .bind(&mosaic.output_path)
        .bind(mosaic.created_at.to_rfc3339())
        .bind(mosaic.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_mosaic_member(&self, membership: &MosaicMembership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mosaic_membership (mosaic_id, ms_path, sequence_index)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(mosaic_id, ms_path) DO UPDATE SET sequence_index = excluded.sequence_index
            "#,
        )
        .bind(&membership.mosaic_id)
        .bind(&membership.ms_path)
        .bind(membership.sequence_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Re-derive a [`MosaicGroup`]'s status enum from a raw column value,
/// exposed for callers that query mosaic rows outside [`ProductsPort`]
/// (e.g. the mosaic-trigger's exclusion query).
pub fn mosaic_status_from_str(s: &str) -> MosaicStatus {
    parse_mosaic_status(s)
}

/// Re-derive a [`ProcessingStage`] from a raw column value.
pub fn processing_stage_from_str(s: &str) -> ProcessingStage {
    parse_stage(s)
}
