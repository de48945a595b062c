use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Resource constraints applied to an execution, whether it runs in-process
/// or as a subprocess (spec §3, §5).
///
/// `to_env_dict` produces the thread-count environment variables the
/// external numeric libraries (OpenBLAS, MKL, numexpr) read on startup;
/// they have to be set before the subprocess's interpreter initializes, so
/// the worker always exports them rather than relying on a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: Option<u32>,
    pub cpu_seconds: Option<u32>,
    pub omp_threads: u32,
    pub mkl_threads: u32,
    pub max_workers: u32,
    pub use_cgroups: bool,
    pub timeout_seconds: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: None,
            cpu_seconds: None,
            omp_threads: 4,
            mkl_threads: 4,
            max_workers: 4,
            use_cgroups: false,
            timeout_seconds: Some(600),
        }
    }
}

impl ResourceLimits {
    /// Thread-count environment variables for the external numeric stack.
    pub fn to_env_dict(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("OMP_NUM_THREADS".to_string(), self.omp_threads.to_string());
        env.insert("MKL_NUM_THREADS".to_string(), self.mkl_threads.to_string());
        env.insert(
            "OPENBLAS_NUM_THREADS".to_string(),
            self.omp_threads.to_string(),
        );
        env.insert(
            "NUMEXPR_NUM_THREADS".to_string(),
            self.omp_threads.to_string(),
        );
        env
    }
}

/// A unit of work dispatched to a stage, in-process or as a subprocess.
///
/// `to_cli_args` renders the task as the argument vector the pipeline's own
/// CLI would accept, so a task built in-process and a task reconstructed
/// from a subprocess invocation are indistinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task_id: String,
    pub stage_name: String,
    pub group_id: String,
    pub input_paths: Vec<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub params: HashMap<String, String>,
    pub limits: ResourceLimits,
}

impl ExecutionTask {
    /// Render this task as CLI arguments for subprocess execution.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "convert".to_string(),
            "--task-id".to_string(),
            self.task_id.clone(),
            "--stage".to_string(),
            self.stage_name.clone(),
            "--group-id".to_string(),
            self.group_id.clone(),
        ];
        for input in &self.input_paths {
            args.push("--input".to_string());
            args.push(input.display().to_string());
        }
        if let Some(output) = &self.output_path {
            args.push("--output".to_string());
            args.push(output.display().to_string());
        }
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();
        for key in keys {
            args.push("--param".to_string());
            args.push(format!("{key}={}", self.params[key]));
        }
        args
    }
}

/// Timing and resource-usage figures collected around a single execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub load_time_s: f64,
    pub phase_time_s: f64,
    pub write_time_s: f64,
    pub total_time_s: f64,
    pub memory_peak_mb: Option<f64>,
    pub files_processed: u32,
    pub output_size_bytes: Option<u64>,
    pub return_code: Option<i32>,
}

/// Outcome of a stage execution, uniform across in-process and subprocess
/// execution modes (spec §4.D).
///
/// `derived` carries stage-specific metadata that doesn't fit the fixed
/// fields above (e.g. conversion's `dec_deg`/`mid_mjd`/`is_calibrator`),
/// mirroring the stage contract's "adds results to `ctx.outputs`" without
/// forcing every stage's output shape into this struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub error_code: Option<u8>,
    pub error_message: Option<String>,
    pub metrics: ExecutionMetrics,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub derived: HashMap<String, String>,
}
