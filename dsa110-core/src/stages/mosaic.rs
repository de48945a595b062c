use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dsa110_contracts::error::{PipelineError, Result};
use dsa110_contracts::repository::ProductsPort;
use dsa110_contracts::stage::{PipelineContext, Stage};
use dsa110_model::{ExecutionMetrics, ExecutionResult, MosaicStatus, MsRecord, ProcessingStage};

use crate::mosaic::{ImagedMs, MosaicTrigger};

/// Unix seconds at MJD 0 (1858-11-17T00:00:00Z), used to turn conversion's
/// `mid_mjd` derived field into the midtime [`MosaicTrigger`] windows on.
const MJD_EPOCH_UNIX_SECONDS: f64 = -3_506_716_800.0;

fn mjd_to_datetime(mjd: f64) -> DateTime<Utc> {
    let unix_seconds = MJD_EPOCH_UNIX_SECONDS + mjd * 86_400.0;
    Utc.timestamp_opt(unix_seconds as i64, 0).single().unwrap_or_else(Utc::now)
}

/// Drives the sliding-window mosaic trigger after every successful imaging
/// run (spec §4.I).
pub struct MosaicStage {
    trigger: Arc<MosaicTrigger>,
    products: Arc<dyn ProductsPort>,
}

impl MosaicStage {
    pub fn new(trigger: Arc<MosaicTrigger>, products: Arc<dyn ProductsPort>) -> Self {
        Self { trigger, products }
    }
}

#[async_trait]
impl Stage for MosaicStage {
    fn name(&self) -> &str {
        "mosaic"
    }

    async fn validate(&self, ctx: &PipelineContext) -> (bool, Option<String>) {
        if ctx.task.input_paths.is_empty() {
            return (false, Some("no imaged MS provided to mosaic stage".to_string()));
        }
        (true, None)
    }

    async fn execute(&self, ctx: PipelineContext) -> Result<ExecutionResult> {
        let started = Instant::now();
        let ms_path = ctx.task.input_paths[0].display().to_string();
        let mid_mjd: f64 = ctx
            .task
            .params
            .get("mid_mjd")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let midtime = mjd_to_datetime(mid_mjd);
        let image_path = ctx.task.params.get("image_path").cloned();
        let calibrator_name = ctx.task.params.get("calibrator_name").cloned();
        // `updated_at` carries the observation midtime (not wall-clock
        // processing time), since MosaicTrigger's candidate window is
        // keyed off it.
        self.products
            .upsert_ms(&MsRecord {
                ms_path: ctx.task.input_paths[0].display().to_string(),
                group_id: ctx.task.group_id.clone(),
                stage: ProcessingStage::Imaged,
                calibrator_name,
                image_path,
                created_at: midtime,
                updated_at: midtime,
            })
            .await?;

        let trigger = ImagedMs { ms_path, midtime };
        let group = self
            .trigger
            .on_ms_imaged(&trigger)
            .await
            .map_err(|err| PipelineError::General(format!("mosaic trigger failed: {err}")))?;

        let mut derived = HashMap::new();
        if let Some(group) = &group {
            derived.insert("mosaic_id".to_string(), group.mosaic_id.clone());
            derived.insert(
                "mosaic_status".to_string(),
                match group.status {
                    MosaicStatus::Collecting => "collecting",
                    MosaicStatus::Ready => "ready",
                    MosaicStatus::Building => "building",
                    MosaicStatus::Completed => "completed",
                    MosaicStatus::Failed => "failed",
                }
                .to_string(),
            );
            if let Some(path) = &group.output_path {
                derived.insert("mosaic_output_path".to_string(), path.clone());
            }
        }

        Ok(ExecutionResult {
            task_id: ctx.task.task_id.clone(),
            success: true,
            error_code: Some(0),
            error_message: None,
            metrics: ExecutionMetrics {
                total_time_s: started.elapsed().as_secs_f64(),
                files_processed: 1,
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
    use dsa110_contracts::external::ExternalMosaicBuilder;
    use dsa110_model::{ExecutionTask, ResourceLimits};
    use sqlx::SqlitePool;
    use std::path::{Path, PathBuf};

    struct StubBuilder;

    #[async_trait]
    impl ExternalMosaicBuilder for StubBuilder {
        async fn build(&self, _image_paths: &[&Path], _output: &Path) -> Result<()> {
            Ok(())
        }
    }

    async fn pool_with_schema() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE ms_records (
                ms_path TEXT PRIMARY KEY, group_id TEXT, stage TEXT, calibrator_name TEXT,
                image_path TEXT, created_at TEXT, updated_at TEXT
            );
            CREATE TABLE mosaic_groups (
                mosaic_id TEXT PRIMARY KEY, status TEXT, window_start TEXT, window_end TEXT,
                output_path TEXT, created_at TEXT, updated_at TEXT
            );
            CREATE TABLE mosaic_membership (
                mosaic_id TEXT, ms_path TEXT, sequence_index INTEGER,
                PRIMARY KEY (mosaic_id, ms_path)
            );
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn task(ms_path: PathBuf, mid_mjd: f64) -> ExecutionTask {
        let mut params = HashMap::new();
        params.insert("mid_mjd".to_string(), mid_mjd.to_string());
        ExecutionTask {
            task_id: "mosaic-1".to_string(),
            stage_name: "mosaic".to_string(),
            group_id: "g1".to_string(),
            input_paths: vec![ms_path],
            output_path: None,
            params,
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn below_window_size_does_not_form_a_mosaic() {
        let pool = pool_with_schema().await;
        let products = Arc::new(crate::products::ProductsRepository::new(pool.clone()));
        let trigger = Arc::new(MosaicTrigger::new(pool, Arc::new(StubBuilder)));
        let stage = MosaicStage::new(trigger, products);
        let ctx = PipelineContext {
            task: task(PathBuf::from("ms0.ms"), 60000.0),
            run_as_subprocess: false,
            workdir: std::env::temp_dir(),
        };
        let result = stage.execute(ctx).await.unwrap();
        assert!(result.success);
        assert!(!result.derived.contains_key("mosaic_id"));
    }

    #[test]
    fn mjd_zero_is_the_conventional_epoch() {
        let dt = mjd_to_datetime(0.0);
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "1858-11-17");
    }
}
