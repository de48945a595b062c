use async_trait::async_trait;
use dsa110_model::{ExecutionResult, ExecutionTask};

use crate::error::Result;

/// Shared state threaded through a stage invocation: the task being run and
/// whatever the stage needs to decide in-process vs subprocess execution.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub task: ExecutionTask,
    pub run_as_subprocess: bool,
    pub workdir: std::path::PathBuf,
}

/// A single step of the pipeline (conversion, calibration solve/apply,
/// imaging, ...). Both execution modes must produce an identical
/// [`ExecutionResult`] for the same task (spec §4.D).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name as it appears in `ExecutionTask::stage_name` and CLI
    /// subcommands.
    fn name(&self) -> &str;

    /// Cheap pre-flight check. Returns `(false, reason)` rather than an
    /// error so a caller can decide whether to retry or fail the group
    /// without unwinding an error type.
    async fn validate(&self, ctx: &PipelineContext) -> (bool, Option<String>);

    /// Run the stage, returning the outcome. Implementations dispatch to
    /// an in-process code path or a subprocess spawn based on
    /// `ctx.run_as_subprocess`, but must map errors to the same
    /// [`crate::error::ErrorCode`] either way.
    async fn execute(&self, ctx: PipelineContext) -> Result<ExecutionResult>;
}
