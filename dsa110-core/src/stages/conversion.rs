use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dsa110_contracts::error::{PipelineError, Result};
use dsa110_contracts::external::ExternalConverter;
use dsa110_contracts::stage::{PipelineContext, Stage};
use dsa110_model::{ExecutionMetrics, ExecutionResult};

/// Turns 16 UVH5 shards of one observation into a single MS (spec §4.E).
///
/// The actual transcoding, antenna-position validation, and MODEL_DATA
/// bootstrapping are delegated to an [`ExternalConverter`]; this stage
/// owns input/output validation and the derived-metadata bookkeeping
/// around that call.
pub struct ConversionStage {
    converter: Arc<dyn ExternalConverter>,
    /// Angular tolerance (degrees) within which the MS pointing is
    /// considered the registered calibrator for its declination strip.
    calibrator_tolerance_deg: f64,
}

impl ConversionStage {
    pub fn new(converter: Arc<dyn ExternalConverter>) -> Self {
        Self {
            converter,
            calibrator_tolerance_deg: 0.5,
        }
    }

    pub fn with_calibrator_tolerance(mut self, degrees: f64) -> Self {
        self.calibrator_tolerance_deg = degrees;
        self
    }
}

#[async_trait]
impl Stage for ConversionStage {
    fn name(&self) -> &str {
        "conversion"
    }

    async fn validate(&self, ctx: &PipelineContext) -> (bool, Option<String>) {
        if ctx.task.input_paths.is_empty() {
            return (false, Some("no input shards provided".to_string()));
        }
        for path in &ctx.task.input_paths {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => return (false, Some(format!("not a file: {}", path.display()))),
                Err(err) => {
                    return (
                        false,
                        Some(format!("shard unreadable: {}: {err}", path.display())),
                    )
                }
            }
        }
        let Some(output_path) = &ctx.task.output_path else {
            return (false, Some("no output path set".to_string()));
        };
        let output_dir = output_path.parent().unwrap_or(output_path.as_path());
        if let Err(err) = std::fs::create_dir_all(output_dir) {
            return (
                false,
                Some(format!("output directory not writable: {output_dir:?}: {err}")),
            );
        }
        (true, None)
    }

    async fn execute(&self, ctx: PipelineContext) -> Result<ExecutionResult> {
        let started = Instant::now();
        let output_path = ctx
            .task
            .output_path
            .clone()
            .ok_or_else(|| PipelineError::Validation("conversion task has no output path".into()))?;

        let inputs: Vec<&std::path::Path> =
            ctx.task.input_paths.iter().map(|p| p.as_path()).collect();

        let load_started = Instant::now();
        for path in &ctx.task.input_paths {
            std::fs::File::open(path)
                .map_err(|err| PipelineError::Io(std::io::Error::new(err.kind(), format!("{}: {err}", path.display()))))?;
        }
        let load_time_s = load_started.elapsed().as_secs_f64();

        let phase_started = Instant::now();
        self.converter
            .convert(&inputs, &output_path)
            .await
            .map_err(|err| PipelineError::Conversion(format!("uvh5 conversion failed: {err}")))?;
        let phase_time_s = phase_started.elapsed().as_secs_f64();

        if !output_path.exists() {
            return Err(PipelineError::Conversion(
                "writer produced no MS at the expected output path".to_string(),
            ));
        }

        let dec_deg: f64 = ctx
            .task
            .params
            .get("dec_deg")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let mid_mjd: f64 = ctx
            .task
            .params
            .get("mid_mjd")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let registered_calibrator_dec: Option<f64> = ctx
            .task
            .params
            .get("registered_calibrator_dec_deg")
            .and_then(|v| v.parse().ok());
        let is_calibrator = registered_calibrator_dec
            .map(|registered| (dec_deg - registered).abs() <= self.calibrator_tolerance_deg)
            .unwrap_or(false);

        let mut derived = HashMap::new();
        derived.insert("dec_deg".to_string(), dec_deg.to_string());
        derived.insert("mid_mjd".to_string(), mid_mjd.to_string());
        derived.insert("is_calibrator".to_string(), is_calibrator.to_string());

        let total_time_s = started.elapsed().as_secs_f64();
        Ok(ExecutionResult {
            task_id: ctx.task.task_id.clone(),
            success: true,
            error_code: Some(0),
            error_message: None,
            metrics: ExecutionMetrics {
                load_time_s,
                phase_time_s,
                write_time_s: 0.0,
                total_time_s,
                memory_peak_mb: None,
                files_processed: ctx.task.input_paths.len() as u32,
                output_size_bytes: std::fs::metadata(&output_path).ok().map(|m| m.len()),
                return_code: Some(0),
            },
            output_path: Some(output_path),
            derived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsa110_model::{ExecutionTask, ResourceLimits};
    use std::path::PathBuf;

    struct StubConverter {
        should_create_output: bool,
    }

    #[async_trait]
    impl ExternalConverter for StubConverter {
        async fn convert(&self, _inputs: &[&std::path::Path], output: &std::path::Path) -> Result<()> {
            if self.should_create_output {
                std::fs::write(output, b"fake ms").unwrap();
            }
            Ok(())
        }
    }

    fn task(input_paths: Vec<PathBuf>, output_path: PathBuf) -> ExecutionTask {
        ExecutionTask {
            task_id: "t1".to_string(),
            stage_name: "conversion".to_string(),
            group_id: "g1".to_string(),
            input_paths,
            output_path: Some(output_path),
            params: HashMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn validate_rejects_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let stage = ConversionStage::new(Arc::new(StubConverter { should_create_output: true }));
        let ctx = PipelineContext {
            task: task(vec![dir.path().join("missing.hdf5")], dir.path().join("out.ms")),
            run_as_subprocess: false,
            workdir: dir.path().to_path_buf(),
        };
        let (ok, reason) = stage.validate(&ctx).await;
        assert!(!ok);
        assert!(reason.unwrap().contains("unreadable"));
    }

    #[tokio::test]
    async fn execute_fails_when_writer_produces_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("shard.hdf5");
        std::fs::write(&shard, b"data").unwrap();
        let stage = ConversionStage::new(Arc::new(StubConverter { should_create_output: false }));
        let ctx = PipelineContext {
            task: task(vec![shard], dir.path().join("out.ms")),
            run_as_subprocess: false,
            workdir: dir.path().to_path_buf(),
        };
        let err = stage.execute(ctx).await.unwrap_err();
        assert_eq!(err.code(), dsa110_contracts::error::ErrorCode::ConversionError);
    }

    #[tokio::test]
    async fn execute_succeeds_and_records_derived_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("shard.hdf5");
        std::fs::write(&shard, b"data").unwrap();
        let stage = ConversionStage::new(Arc::new(StubConverter { should_create_output: true }));
        let mut t = task(vec![shard], dir.path().join("out.ms"));
        t.params.insert("dec_deg".to_string(), "54.3".to_string());
        t.params
            .insert("registered_calibrator_dec_deg".to_string(), "54.3".to_string());
        let ctx = PipelineContext {
            task: t,
            run_as_subprocess: false,
            workdir: dir.path().to_path_buf(),
        };
        let result = stage.execute(ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.derived.get("is_calibrator").unwrap(), "true");
    }
}
