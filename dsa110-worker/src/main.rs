//! Worker binary for the DSA-110 continuum imaging pipeline.
//!
//! `worker` runs the observation-group processing loop (spec §4.K);
//! `convert` is the single-stage subprocess entrypoint the subprocess
//! execution mode shells out to, and its flag set mirrors
//! `ExecutionTask::to_cli_args()` exactly so the two execution modes stay
//! interchangeable (spec §6).

mod subprocess;
mod task_builder;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dsa110_config::{CalibrationConfig, DiskThresholds, ExecutionMode, ImagingConfig, PipelineConfig};
use dsa110_contracts::stage::{PipelineContext, Stage};
use dsa110_core::{
    CalibrationApplyStage, CalibrationSolveStage, CalibratorRegistryRepository, ConversionStage,
    DiskMonitor, FileIndexRepository, ImagingStage, MosaicStage, MosaicTrigger, PhotometryStage,
    ProductsRepository, QueueRepository, WorkerLoop,
};
use dsa110_model::{ExecutionTask, ResourceLimits};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use subprocess::{
    SubprocessCalibrationEngine, SubprocessConverter, SubprocessImager, SubprocessMosaicBuilder,
};
use task_builder::DefaultTaskBuilder;

#[derive(Parser, Debug)]
#[command(name = "dsa110-worker")]
#[command(about = "DSA-110 continuum imaging pipeline worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the observation-group processing loop.
    Worker(Box<WorkerArgs>),
    /// Run a single stage for one task; the subprocess execution-mode
    /// entrypoint.
    Convert(ConvertArgs),
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[arg(long)]
    input_dir: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
    #[arg(long)]
    scratch_dir: PathBuf,
    #[arg(long)]
    queue_db: PathBuf,
    #[arg(long)]
    registry_db: PathBuf,
    #[arg(long, default_value = "hdf5_file_index.sqlite3")]
    index_db: PathBuf,
    #[arg(long, default_value = "products.sqlite3")]
    products_db: PathBuf,
    #[arg(long, default_value = "data_registry.sqlite3")]
    data_registry_db: PathBuf,
    #[arg(long, default_value_t = 16)]
    expected_subbands: u32,
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    #[arg(long, default_value_t = 5)]
    worker_poll_interval: u64,
    #[arg(long, value_enum, default_value = "auto")]
    execution_mode: CliExecutionMode,
    #[arg(long)]
    memory_mb: Option<u32>,
    #[arg(long, default_value_t = 4)]
    omp_threads: u32,
    #[arg(long, default_value_t = 4)]
    max_workers: u32,
    #[arg(long, default_value_t = 600)]
    timeout: u32,
    #[arg(long, default_value_t = 300)]
    cal_fence_timeout: u64,
    #[arg(long, default_value_t = true)]
    enable_calibration_solving: bool,
    #[arg(long, default_value_t = true)]
    enable_group_imaging: bool,
    #[arg(long, default_value_t = true)]
    enable_mosaic_creation: bool,
    #[arg(long, default_value_t = true)]
    enable_photometry: bool,
    #[arg(long, default_value_t = false)]
    enable_auto_qa: bool,
    #[arg(long, default_value_t = false)]
    enable_auto_publish: bool,
    #[arg(long, default_value_t = 200.0)]
    disk_warning_free_gb: f64,
    #[arg(long, default_value_t = 50.0)]
    disk_critical_free_gb: f64,
    #[arg(long, default_value = "uvh5-to-ms")]
    converter_bin: String,
    #[arg(long, default_value = "cal-solve")]
    calibration_solve_bin: String,
    #[arg(long, default_value = "cal-apply")]
    calibration_apply_bin: String,
    #[arg(long, default_value = "cal-antenna-health")]
    antenna_health_bin: String,
    #[arg(long, default_value = "image-clean")]
    imager_bin: String,
    #[arg(long, default_value = "mosaic-build")]
    mosaic_builder_bin: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliExecutionMode {
    Inprocess,
    Subprocess,
    Auto,
}

impl From<CliExecutionMode> for ExecutionMode {
    fn from(mode: CliExecutionMode) -> Self {
        match mode {
            CliExecutionMode::Inprocess => ExecutionMode::Inprocess,
            CliExecutionMode::Subprocess => ExecutionMode::Subprocess,
            CliExecutionMode::Auto => ExecutionMode::Auto,
        }
    }
}

/// Mirrors `ExecutionTask::to_cli_args()`: `convert --task-id .. --stage ..
/// --group-id .. --input .. [--input ..] [--output ..] [--param k=v ..]`.
#[derive(Parser, Debug)]
struct ConvertArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    stage: String,
    #[arg(long)]
    group_id: String,
    #[arg(long)]
    input: Vec<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, value_parser = parse_param)]
    param: Vec<(String, String)>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dsa110_worker=info,dsa110_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => run_worker(*args).await,
        Command::Convert(args) => run_convert(args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let config = PipelineConfig {
        input_dir: args.input_dir,
        output_dir: args.output_dir.clone(),
        scratch_dir: args.scratch_dir.clone(),
        index_db: args.index_db,
        queue_db: args.queue_db,
        registry_db: args.registry_db,
        products_db: args.products_db,
        data_registry_db: args.data_registry_db,
        expected_subbands: args.expected_subbands,
        poll_interval_seconds: args.poll_interval,
        worker_poll_interval_seconds: args.worker_poll_interval,
        execution_mode: args.execution_mode.into(),
        resource_limits: dsa110_config::ResourceLimitsConfig {
            memory_mb: args.memory_mb,
            cpu_seconds: None,
            omp_threads: args.omp_threads,
            mkl_threads: args.omp_threads,
            max_workers: args.max_workers,
            use_cgroups: false,
            timeout_seconds: args.timeout,
        },
        features: dsa110_config::FeatureToggles {
            calibration_solving: args.enable_calibration_solving,
            group_imaging: args.enable_group_imaging,
            mosaic_creation: args.enable_mosaic_creation,
            photometry: args.enable_photometry,
            auto_qa: args.enable_auto_qa,
            auto_publish: args.enable_auto_publish,
        },
        disk_thresholds: DiskThresholds {
            warning_free_gb: args.disk_warning_free_gb,
            critical_free_gb: args.disk_critical_free_gb,
        },
        cal_fence_timeout_seconds: args.cal_fence_timeout,
        imaging: ImagingConfig::default(),
        calibration: CalibrationConfig::default(),
        ..PipelineConfig::default()
    };

    let databases = dsa110_core::Databases::open(&config).await?;

    let queue: Arc<dyn dsa110_contracts::repository::QueuePort> =
        Arc::new(QueueRepository::new(databases.queue.clone()));
    let file_index: Arc<dyn dsa110_contracts::repository::FileIndexPort> =
        Arc::new(FileIndexRepository::new(databases.index.clone()));
    let calibrator_registry: Arc<dyn dsa110_contracts::repository::CalibratorRegistryPort> =
        Arc::new(CalibratorRegistryRepository::new(databases.registry.clone()));

    let converter = Arc::new(SubprocessConverter { executable: args.converter_bin });
    let calibration_engine = Arc::new(SubprocessCalibrationEngine {
        solve_executable: args.calibration_solve_bin,
        apply_executable: args.calibration_apply_bin,
        antenna_health_executable: args.antenna_health_bin,
    });
    let imager = Arc::new(SubprocessImager { executable: args.imager_bin });
    let mosaic_builder = Arc::new(SubprocessMosaicBuilder { executable: args.mosaic_builder_bin });

    let products: Arc<dyn dsa110_contracts::repository::ProductsPort> =
        Arc::new(ProductsRepository::new(databases.products.clone()));

    let mut stages: Vec<Arc<dyn Stage>> = vec![Arc::new(ConversionStage::new(converter))];
    if config.features.calibration_solving {
        stages.push(Arc::new(CalibrationSolveStage::new(
            calibration_engine.clone(),
            config.calibration.clone(),
        )));
        stages.push(Arc::new(CalibrationApplyStage::new(calibration_engine)));
    }
    if config.features.group_imaging {
        stages.push(Arc::new(ImagingStage::new(imager, config.imaging.clone())));
    }
    if config.features.photometry {
        stages.push(Arc::new(PhotometryStage::new(products.clone(), config.photometry.clone())));
    }
    if config.features.mosaic_creation {
        let trigger = MosaicTrigger::new(databases.products.clone(), mosaic_builder)
            .with_window(chrono::Duration::minutes(config.photometry.mosaic_window_minutes));
        stages.push(Arc::new(MosaicStage::new(Arc::new(trigger), products.clone())));
    }

    let task_builder = Arc::new(DefaultTaskBuilder::new(
        file_index.clone(),
        calibrator_registry,
        config.scratch_dir.clone(),
        config.output_dir.clone(),
        config.resource_limits.clone().into(),
    ));

    let disk_monitor = DiskMonitor::new(
        vec![config.input_dir.clone(), config.output_dir, config.scratch_dir.clone()],
        config.disk_thresholds,
    );

    let worker = WorkerLoop::new(
        queue,
        file_index,
        stages,
        task_builder,
        disk_monitor,
        config.input_dir,
        config.expected_subbands,
        Duration::from_secs(config.poll_interval_seconds),
        matches!(config.execution_mode, ExecutionMode::Subprocess),
        config.scratch_dir,
    );

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if let Err(err) = WorkerLoop::watch_for_shutdown(shutdown).await {
            tracing::error!(error = %err, "signal watcher failed");
        }
    });

    worker.run().await;
    Ok(())
}

async fn run_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let params: HashMap<String, String> = args.param.into_iter().collect();
    let task = ExecutionTask {
        task_id: args.task_id,
        stage_name: args.stage.clone(),
        group_id: args.group_id,
        input_paths: args.input,
        output_path: args.output,
        params,
        limits: ResourceLimits::default(),
    };

    let converter = Arc::new(SubprocessConverter { executable: "uvh5-to-ms".to_string() });
    let calibration_engine = Arc::new(SubprocessCalibrationEngine {
        solve_executable: "cal-solve".to_string(),
        apply_executable: "cal-apply".to_string(),
        antenna_health_executable: "cal-antenna-health".to_string(),
    });
    let imager = Arc::new(SubprocessImager { executable: "image-clean".to_string() });

    let stage: Arc<dyn Stage> = match args.stage.as_str() {
        "conversion" => Arc::new(ConversionStage::new(converter)),
        "calibration_solve" => {
            Arc::new(CalibrationSolveStage::new(calibration_engine, CalibrationConfig::default()))
        }
        "calibration_apply" => Arc::new(CalibrationApplyStage::new(calibration_engine)),
        "imaging" => Arc::new(ImagingStage::new(imager, ImagingConfig::default())),
        other => {
            eprintln!("unknown stage: {other}");
            std::process::exit(dsa110_contracts::error::ErrorCode::ValidationError as i32);
        }
    };

    let ctx = PipelineContext {
        task,
        run_as_subprocess: true,
        workdir: std::env::current_dir()?,
    };

    let (valid, reason) = stage.validate(&ctx).await;
    if !valid {
        eprintln!("validation failed: {}", reason.unwrap_or_default());
        std::process::exit(dsa110_contracts::error::ErrorCode::ValidationError as i32);
    }

    match stage.execute(ctx).await {
        Ok(result) => {
            println!("{}", serde_json::to_string(&result)?);
            std::process::exit(if result.success { 0 } else { result.error_code.unwrap_or(1) as i32 });
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(err.code() as i32);
        }
    }
}
