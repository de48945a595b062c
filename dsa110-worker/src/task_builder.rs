use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dsa110_contracts::error::Result;
use dsa110_contracts::external::GroupTaskBuilder;
use dsa110_contracts::repository::{CalibratorRegistryPort, FileIndexPort};
use dsa110_model::{ExecutionTask, ObservationGroup, ExecutionResult, ResourceLimits};

/// Resolves an observation group's shard paths and the previous stage's
/// output into the [`ExecutionTask`] for the next stage, delegating the
/// scientific work itself to the stage's `External*` collaborator (spec
/// §4.D, §4.K).
pub struct DefaultTaskBuilder {
    file_index: Arc<dyn FileIndexPort>,
    calibrator_registry: Arc<dyn CalibratorRegistryPort>,
    scratch_dir: PathBuf,
    output_dir: PathBuf,
    limits: ResourceLimits,
}

impl DefaultTaskBuilder {
    pub fn new(
        file_index: Arc<dyn FileIndexPort>,
        calibrator_registry: Arc<dyn CalibratorRegistryPort>,
        scratch_dir: PathBuf,
        output_dir: PathBuf,
        limits: ResourceLimits,
    ) -> Self {
        Self { file_index, calibrator_registry, scratch_dir, output_dir, limits }
    }

    fn ms_path(&self, group_id: &str) -> PathBuf {
        self.scratch_dir.join(format!("{group_id}.ms"))
    }
}

#[async_trait]
impl GroupTaskBuilder for DefaultTaskBuilder {
    async fn build_task(
        &self,
        group: &ObservationGroup,
        stage_name: &str,
        _previous: Option<&ExecutionResult>,
    ) -> Result<ExecutionTask> {
        let task_id = format!("{}-{stage_name}", group.group_id);
        let mut params = HashMap::new();

        let (input_paths, output_path) = match stage_name {
            "conversion" => {
                let shards = self.file_index.get_group(&group.group_id).await?;
                let inputs = shards.into_iter().map(|f| PathBuf::from(f.path)).collect();
                (inputs, Some(self.ms_path(&group.group_id)))
            }
            "calibration_solve" => {
                let observation_date = group.group_id.get(0..10).unwrap_or(&group.group_id);
                if let Some(registration) = self.calibrator_registry.get_for_date(observation_date).await? {
                    params.insert("calibrator_name".to_string(), registration.source.name);
                }
                params.insert("phaseshift_mode".to_string(), "calibrator".to_string());
                (vec![self.ms_path(&group.group_id)], None)
            }
            "calibration_apply" => {
                // `is_calibrator`, `dec_deg` (from conversion) and
                // `candidate_tables` (from calibration_solve) are filled in
                // by the worker loop's cross-stage carry-forward before
                // this task is dispatched.
                (vec![self.ms_path(&group.group_id)], None)
            }
            "imaging" => {
                (
                    vec![self.ms_path(&group.group_id)],
                    Some(self.output_dir.join(format!("{}.image", group.group_id))),
                )
            }
            "photometry" => {
                // `detected_sources`/`catalog_sources` are populated by the
                // worker loop's cross-stage carry-forward when an upstream
                // collaborator supplies them; absent, the stage is a no-op
                // for this group.
                (vec![self.ms_path(&group.group_id)], None)
            }
            "mosaic" => {
                // `mid_mjd` (from conversion) is filled in by the carry-
                // forward before this task is dispatched.
                (vec![self.ms_path(&group.group_id)], None)
            }
            other => {
                tracing::warn!(stage = other, "unrecognized stage in task builder, passing through MS path");
                (vec![self.ms_path(&group.group_id)], None)
            }
        };

        Ok(ExecutionTask {
            task_id,
            stage_name: stage_name.to_string(),
            group_id: group.group_id.clone(),
            input_paths,
            output_path,
            params,
            limits: self.limits.clone(),
        })
    }
}
