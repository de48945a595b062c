use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dsa110_config::DiskThresholds;
use dsa110_contracts::error::Result;
use dsa110_contracts::external::GroupTaskBuilder;
use dsa110_contracts::repository::{FileIndexPort, QueuePort};
use dsa110_contracts::stage::{PipelineContext, Stage};
use dsa110_model::{ExecutionResult, ObservationGroup, ObservationGroupState};
use sysinfo::Disks;

use crate::filename::{derive_group_id, parse_shard_filename, DEFAULT_GROUP_TOLERANCE_SECONDS};

/// How far back `ingest_once` looks for newly-complete groups on each tick
/// (spec §4.A `query_subband_groups`: window bounded by `start_time`/
/// `end_time`, not unbounded).
const INGEST_LOOKBACK: chrono::Duration = chrono::Duration::hours(24);

/// Fixed back-off applied whenever the disk monitor reports a critical
/// threshold breach (spec §4.K: "if disk monitor says critical: sleep
/// 60s; continue").
const DISK_CRITICAL_BACKOFF: Duration = Duration::from_secs(60);

/// Stage names the worker treats as fatal: their failure marks the whole
/// group `failed` (spec §4.K: "Imaging failure is non-fatal"; everything
/// upstream of it is not).
const FATAL_STAGES: [&str; 3] = ["conversion", "calibration_solve", "calibration_apply"];

/// Polls watched paths for free disk space against [`DiskThresholds`]
/// (spec §5: "Disk space is monitored per watched path").
pub struct DiskMonitor {
    watched_paths: Vec<PathBuf>,
    thresholds: DiskThresholds,
}

impl DiskMonitor {
    pub fn new(watched_paths: Vec<PathBuf>, thresholds: DiskThresholds) -> Self {
        Self { watched_paths, thresholds }
    }

    /// `true` if any watched path's free space is at or below
    /// `critical_free_gb`.
    pub fn is_critical(&self) -> bool {
        let disks = Disks::new_with_refreshed_list();
        for path in &self.watched_paths {
            let Some(free_gb) = free_gb_for(&disks, path) else { continue };
            if free_gb <= self.thresholds.critical_free_gb {
                tracing::warn!(path = %path.display(), free_gb, "disk space below critical threshold");
                return true;
            }
            if free_gb <= self.thresholds.warning_free_gb {
                tracing::warn!(path = %path.display(), free_gb, "disk space below warning threshold");
            }
        }
        false
    }
}

/// Recover the `group_id` a `query_subband_groups` path belongs to by
/// re-parsing its filename and re-deriving the id, rather than threading
/// the id through the spec-literal `List[List[path]]` return shape.
fn group_id_for_path(path: &str) -> Option<String> {
    let filename = std::path::Path::new(path).file_name()?.to_str()?;
    let shard = parse_shard_filename(filename).ok()?;
    Some(derive_group_id(&shard.timestamp, DEFAULT_GROUP_TOLERANCE_SECONDS))
}

fn free_gb_for(disks: &Disks, path: &std::path::Path) -> Option<f64> {
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / 1024.0 / 1024.0 / 1024.0)
}

/// Outcome of running one observation group through the stage chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    Completed,
    Failed,
}

/// A `(name, active_label, done_label)` triple mapping a [`Stage`]'s
/// identity to the processing-state-machine labels the spec assigns it
/// (spec §4.K: `CONVERTING -> CONVERTED -> CALIBRATING -> CALIBRATED ->
/// IMAGING -> IMAGED`).
fn stage_labels(stage_name: &str) -> (&'static str, &'static str) {
    match stage_name {
        "conversion" => ("converting", "converted"),
        "calibration_solve" | "calibration_apply" => ("calibrating", "calibrated"),
        "imaging" => ("imaging", "imaged"),
        "photometry" => ("measuring photometry", "photometry_done"),
        "mosaic" => ("mosaicking", "mosaicked"),
        _ => ("processing", "processed"),
    }
}

/// Drives observation groups through the stage chain and the top-level
/// poll loop (spec §4.K, §5).
pub struct WorkerLoop {
    queue: Arc<dyn QueuePort>,
    file_index: Arc<dyn FileIndexPort>,
    stages: Vec<Arc<dyn Stage>>,
    task_builder: Arc<dyn GroupTaskBuilder>,
    disk_monitor: DiskMonitor,
    input_dir: PathBuf,
    expected_subbands: u32,
    poll_interval: Duration,
    run_as_subprocess: bool,
    workdir: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl WorkerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueuePort>,
        file_index: Arc<dyn FileIndexPort>,
        stages: Vec<Arc<dyn Stage>>,
        task_builder: Arc<dyn GroupTaskBuilder>,
        disk_monitor: DiskMonitor,
        input_dir: PathBuf,
        expected_subbands: u32,
        poll_interval: Duration,
        run_as_subprocess: bool,
        workdir: PathBuf,
    ) -> Self {
        Self {
            queue,
            file_index,
            stages,
            task_builder,
            disk_monitor,
            input_dir,
            expected_subbands,
            poll_interval,
            run_as_subprocess,
            workdir,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Scan `input_dir` into the file index, then upsert/advance an
    /// `ObservationGroup` to `pending` for every complete (all expected
    /// subbands present and stored) group the index now reports (spec §3,
    /// §4.A-B: "file arrives -> index -> group -> queue"). Groups already
    /// past `collecting` (in progress, completed, failed) are left alone so
    /// a re-scan never regresses a group the worker already claimed.
    pub async fn ingest_once(&self) -> Result<()> {
        self.file_index.index(&self.input_dir, false, None).await?;

        let now = Utc::now();
        let groups = self
            .file_index
            .query_subband_groups(now - INGEST_LOOKBACK, now, 1.0, true)
            .await?;

        for paths in groups {
            let Some(group_id) = paths.first().and_then(|p| group_id_for_path(p)) else {
                continue;
            };

            if let Ok(Some(existing)) = self.queue.get_group(&group_id).await {
                if existing.state != ObservationGroupState::Collecting {
                    continue;
                }
            }

            let group = ObservationGroup {
                group_id: group_id.clone(),
                state: ObservationGroupState::Pending,
                received_at: now,
                last_update: now,
                expected_subbands: self.expected_subbands,
                retry_count: 0,
                processing_stage: None,
                chunk_minutes: None,
            };
            if let Err(err) = self.queue.upsert_group(&group).await {
                tracing::error!(group_id = %group_id, error = %err, "failed to upsert observation group");
            }
        }
        Ok(())
    }

    /// A handle the caller can flip from a signal handler to request
    /// graceful shutdown: the loop finishes its current group, then exits
    /// (spec §4.K, §5: "A SIGINT/SIGTERM to the worker causes the loop to
    /// exit after the current group finishes").
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Top-level loop (spec §4.K pseudocode).
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested, exiting worker loop");
                return;
            }

            if self.disk_monitor.is_critical() {
                tokio::time::sleep(DISK_CRITICAL_BACKOFF).await;
                continue;
            }

            if let Err(err) = self.ingest_once().await {
                tracing::error!(error = %err, "ingest tick failed");
            }

            let group = match self.queue.acquire_next_pending().await {
                Ok(Some(group)) => group,
                Ok(None) => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to acquire next pending group");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            let group_id = group.group_id.clone();
            let outcome = self.process_group(group).await;
            let final_state = match outcome {
                GroupOutcome::Completed => ObservationGroupState::Completed,
                GroupOutcome::Failed => ObservationGroupState::Failed,
            };
            if let Err(err) = self.queue.update_state(&group_id, final_state, Some(final_state.as_str())).await {
                tracing::error!(group_id, error = %err, "failed to record final group state");
            }
        }
    }

    /// Run the stage chain for one group, updating the processing-state
    /// machine at each transition and aggregating stage timings (spec
    /// §4.K `process_group`).
    pub async fn process_group(&self, group: ObservationGroup) -> GroupOutcome {
        let mut previous: Option<ExecutionResult> = None;
        let mut total_time_s = 0.0;
        // Derived fields accumulate across the whole chain (e.g.
        // conversion's `is_calibrator`/`dec_deg`, calibration_solve's
        // `tables`), since `previous` only carries the immediately prior
        // stage's result and several downstream stages need fields an
        // earlier stage produced (spec §4.F.2 step 1).
        let mut carried: HashMap<String, String> = HashMap::new();

        for stage in &self.stages {
            let (active_label, done_label) = stage_labels(stage.name());
            let fatal = FATAL_STAGES.contains(&stage.name());

            if let Err(err) = self
                .queue
                .update_state(&group.group_id, ObservationGroupState::InProgress, Some(active_label))
                .await
            {
                tracing::warn!(group_id = %group.group_id, error = %err, "failed to record processing-stage transition");
            }

            let mut task = match self.task_builder.build_task(&group, stage.name(), previous.as_ref()).await {
                Ok(task) => task,
                Err(err) => {
                    tracing::error!(group_id = %group.group_id, stage = stage.name(), error = %err, "failed to build stage task");
                    if fatal {
                        return GroupOutcome::Failed;
                    }
                    continue;
                }
            };
            for (key, value) in &carried {
                task.params.entry(key.clone()).or_insert_with(|| value.clone());
            }

            let ctx = PipelineContext {
                task,
                run_as_subprocess: self.run_as_subprocess,
                workdir: self.workdir.clone(),
            };

            let (valid, reason) = stage.validate(&ctx).await;
            if !valid {
                tracing::error!(group_id = %group.group_id, stage = stage.name(), reason = ?reason, "stage validation failed");
                if fatal {
                    return GroupOutcome::Failed;
                }
                continue;
            }

            match stage.execute(ctx).await {
                Ok(result) => {
                    total_time_s += result.metrics.total_time_s;
                    if !result.success && fatal {
                        tracing::error!(
                            group_id = %group.group_id,
                            stage = stage.name(),
                            error = ?result.error_message,
                            "fatal stage failed"
                        );
                        return GroupOutcome::Failed;
                    }
                    if !result.success {
                        tracing::warn!(
                            group_id = %group.group_id,
                            stage = stage.name(),
                            error = ?result.error_message,
                            "non-fatal stage failed, continuing"
                        );
                        continue;
                    }
                    if let Err(err) = self
                        .queue
                        .update_state(&group.group_id, ObservationGroupState::InProgress, Some(done_label))
                        .await
                    {
                        tracing::warn!(group_id = %group.group_id, error = %err, "failed to record processing-stage transition");
                    }
                    if stage.name() == "calibration_solve" {
                        if let Some(tables) = result.derived.get("tables") {
                            let candidate_tables = tables
                                .split(',')
                                .filter(|path| !path.is_empty())
                                .map(|path| format!("{path}:nearest"))
                                .collect::<Vec<_>>()
                                .join("|");
                            carried.insert("candidate_tables".to_string(), candidate_tables);
                        }
                    }
                    carried.extend(result.derived.clone());
                    previous = Some(result);
                }
                Err(err) => {
                    tracing::error!(group_id = %group.group_id, stage = stage.name(), error = %err, "stage execution error");
                    if fatal {
                        return GroupOutcome::Failed;
                    }
                }
            }
        }

        tracing::info!(group_id = %group.group_id, total_time_s, "group processing complete");
        GroupOutcome::Completed
    }

    /// Listen for SIGINT/SIGTERM and flip the shutdown flag. Runs until
    /// cancelled; intended to be spawned alongside [`Self::run`].
    pub async fn watch_for_shutdown(shutdown: Arc<AtomicBool>) -> Result<()> {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("received shutdown signal");
        shutdown.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsa110_model::ResourceLimits;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubQueue {
        group: Mutex<Option<ObservationGroup>>,
        states: Mutex<Vec<(String, ObservationGroupState, Option<String>)>>,
    }

    #[async_trait]
    impl QueuePort for StubQueue {
        async fn upsert_group(&self, _group: &ObservationGroup) -> Result<()> {
            Ok(())
        }
        async fn acquire_next_pending(&self) -> Result<Option<ObservationGroup>> {
            Ok(self.group.lock().unwrap().take())
        }
        async fn update_state(
            &self,
            group_id: &str,
            state: ObservationGroupState,
            processing_stage: Option<&str>,
        ) -> Result<()> {
            self.states.lock().unwrap().push((
                group_id.to_string(),
                state,
                processing_stage.map(|s| s.to_string()),
            ));
            Ok(())
        }
        async fn get_group(&self, _group_id: &str) -> Result<Option<ObservationGroup>> {
            Ok(None)
        }
        async fn increment_retry(&self, _group_id: &str) -> Result<u32> {
            Ok(0)
        }
    }

    struct StubFileIndex;

    #[async_trait]
    impl FileIndexPort for StubFileIndex {
        async fn index(
            &self,
            _input_dir: &std::path::Path,
            _force_rescan: bool,
            _max_files: Option<usize>,
        ) -> Result<dsa110_model::IndexStats> {
            Ok(dsa110_model::IndexStats::default())
        }
        async fn upsert_many(&self, _files: &[dsa110_model::IndexedFile]) -> Result<dsa110_model::IndexStats> {
            Ok(dsa110_model::IndexStats::default())
        }
        async fn mark_missing(&self, _paths: &[String]) -> Result<usize> {
            Ok(0)
        }
        async fn get_group(&self, _group_id: &str) -> Result<Vec<dsa110_model::IndexedFile>> {
            Ok(vec![])
        }
        async fn query_subband_groups(
            &self,
            _start_time: chrono::DateTime<Utc>,
            _end_time: chrono::DateTime<Utc>,
            _tolerance_s: f64,
            _only_stored: bool,
        ) -> Result<Vec<Vec<String>>> {
            Ok(vec![])
        }
        async fn is_group_complete(&self, _group_id: &str, _expected_subbands: u32) -> Result<bool> {
            Ok(false)
        }
    }

    struct StubTaskBuilder;

    #[async_trait]
    impl GroupTaskBuilder for StubTaskBuilder {
        async fn build_task(
            &self,
            group: &ObservationGroup,
            stage_name: &str,
            _previous: Option<&ExecutionResult>,
        ) -> Result<dsa110_model::ExecutionTask> {
            Ok(dsa110_model::ExecutionTask {
                task_id: format!("{}-{stage_name}", group.group_id),
                stage_name: stage_name.to_string(),
                group_id: group.group_id.clone(),
                input_paths: vec![],
                output_path: None,
                params: HashMap::new(),
                limits: ResourceLimits::default(),
            })
        }
    }

    struct OkStage {
        name: &'static str,
        succeeds: bool,
    }

    #[async_trait]
    impl Stage for OkStage {
        fn name(&self) -> &str {
            self.name
        }
        async fn validate(&self, _ctx: &PipelineContext) -> (bool, Option<String>) {
            (true, None)
        }
        async fn execute(&self, ctx: PipelineContext) -> Result<ExecutionResult> {
            Ok(ExecutionResult {
                task_id: ctx.task.task_id,
                success: self.succeeds,
                error_code: if self.succeeds { Some(0) } else { Some(1) },
                error_message: if self.succeeds { None } else { Some("boom".to_string()) },
                ..Default::default()
            })
        }
    }

    fn group() -> ObservationGroup {
        ObservationGroup {
            group_id: "g1".to_string(),
            state: ObservationGroupState::InProgress,
            received_at: chrono::Utc::now(),
            last_update: chrono::Utc::now(),
            expected_subbands: 16,
            retry_count: 0,
            processing_stage: None,
            chunk_minutes: None,
        }
    }

    fn loop_with_stages(stages: Vec<Arc<dyn Stage>>) -> (WorkerLoop, Arc<StubQueue>) {
        let queue = Arc::new(StubQueue { group: Mutex::new(None), states: Mutex::new(Vec::new()) });
        let worker = WorkerLoop::new(
            queue.clone(),
            Arc::new(StubFileIndex),
            stages,
            Arc::new(StubTaskBuilder),
            DiskMonitor::new(vec![], DiskThresholds::default()),
            PathBuf::from("."),
            16,
            Duration::from_millis(1),
            false,
            PathBuf::from("."),
        );
        (worker, queue)
    }

    #[tokio::test]
    async fn all_stages_succeeding_completes_the_group() {
        let (worker, _queue) = loop_with_stages(vec![
            Arc::new(OkStage { name: "conversion", succeeds: true }),
            Arc::new(OkStage { name: "calibration_solve", succeeds: true }),
            Arc::new(OkStage { name: "imaging", succeeds: true }),
        ]);
        let outcome = worker.process_group(group()).await;
        assert_eq!(outcome, GroupOutcome::Completed);
    }

    #[tokio::test]
    async fn fatal_stage_failure_fails_the_group() {
        let (worker, _queue) = loop_with_stages(vec![
            Arc::new(OkStage { name: "conversion", succeeds: false }),
            Arc::new(OkStage { name: "imaging", succeeds: true }),
        ]);
        let outcome = worker.process_group(group()).await;
        assert_eq!(outcome, GroupOutcome::Failed);
    }

    #[tokio::test]
    async fn imaging_failure_is_non_fatal() {
        let (worker, _queue) = loop_with_stages(vec![
            Arc::new(OkStage { name: "conversion", succeeds: true }),
            Arc::new(OkStage { name: "imaging", succeeds: false }),
        ]);
        let outcome = worker.process_group(group()).await;
        assert_eq!(outcome, GroupOutcome::Completed);
    }
}
