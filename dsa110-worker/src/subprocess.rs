use std::path::Path;

use async_trait::async_trait;
use dsa110_contracts::error::{PipelineError, Result};
use dsa110_contracts::external::{ExternalCalibrationEngine, ExternalConverter, ExternalImager, ExternalMosaicBuilder};
use tokio::process::Command;

/// Runs an external tool and maps a non-zero exit to a [`PipelineError`]
/// classified by the tool's stderr (spec §7: subprocess return codes
/// mapped via the canonical taxonomy).
async fn run(mut cmd: Command) -> Result<()> {
    let output = cmd.output().await.map_err(PipelineError::Io)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    match output.status.code() {
        Some(-9) | None => Err(PipelineError::General("subprocess killed (possible OOM)".to_string())),
        Some(_) => Err(PipelineError::from_message(stderr)),
    }
}

/// Shells out to the observatory's UVH5-to-MS conversion tool (spec §4.E
/// Non-goal: the writer itself).
pub struct SubprocessConverter {
    pub executable: String,
}

#[async_trait]
impl ExternalConverter for SubprocessConverter {
    async fn convert(&self, inputs: &[&Path], output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--output").arg(output);
        for input in inputs {
            cmd.arg("--input").arg(input);
        }
        run(cmd).await
    }
}

/// Shells out to the CASA-based calibration solver (spec §4.F Non-goal).
pub struct SubprocessCalibrationEngine {
    pub solve_executable: String,
    pub apply_executable: String,
    pub antenna_health_executable: String,
}

#[async_trait]
impl ExternalCalibrationEngine for SubprocessCalibrationEngine {
    async fn solve(
        &self,
        ms_path: &Path,
        calibrator_name: &str,
        refant: &str,
        mode: &str,
        manual_ra_deg: Option<f64>,
        manual_dec_deg: Option<f64>,
    ) -> Result<Vec<String>> {
        let mut cmd = Command::new(&self.solve_executable);
        cmd.arg("--ms").arg(ms_path);
        cmd.arg("--calibrator").arg(calibrator_name);
        cmd.arg("--refant").arg(refant);
        cmd.arg("--phaseshift-mode").arg(mode);
        if let Some(ra) = manual_ra_deg {
            cmd.arg("--manual-ra-deg").arg(ra.to_string());
        }
        if let Some(dec) = manual_dec_deg {
            cmd.arg("--manual-dec-deg").arg(dec.to_string());
        }
        let output = cmd.output().await.map_err(PipelineError::Io)?;
        if !output.status.success() {
            return Err(PipelineError::Calibration(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn apply(&self, ms_path: &Path, caltables: &[(String, String)]) -> Result<()> {
        let mut cmd = Command::new(&self.apply_executable);
        cmd.arg("--ms").arg(ms_path);
        for (table, interp) in caltables {
            cmd.arg("--caltable").arg(format!("{table}:{interp}"));
        }
        run(cmd).await
    }

    async fn antenna_health(&self, table_path: &str) -> Result<Vec<(u32, f64)>> {
        let output = Command::new(&self.antenna_health_executable)
            .arg("--table")
            .arg(table_path)
            .output()
            .await
            .map_err(PipelineError::Io)?;
        if !output.status.success() {
            return Err(PipelineError::Calibration(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split(',');
                let antenna: u32 = parts.next()?.trim().parse().ok()?;
                let fraction: f64 = parts.next()?.trim().parse().ok()?;
                Some((antenna, fraction))
            })
            .collect())
    }
}

/// Shells out to the CLEAN imaging tool (spec §4.G Non-goal).
pub struct SubprocessImager {
    pub executable: String,
}

#[async_trait]
impl ExternalImager for SubprocessImager {
    async fn image(&self, ms_path: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--ms").arg(ms_path);
        cmd.arg("--output").arg(output);
        run(cmd).await
    }
}

/// Shells out to the mosaic combination tool (spec §4.I Non-goal).
pub struct SubprocessMosaicBuilder {
    pub executable: String,
}

#[async_trait]
impl ExternalMosaicBuilder for SubprocessMosaicBuilder {
    async fn build(&self, image_paths: &[&Path], output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--output").arg(output);
        for image in image_paths {
            cmd.arg("--image").arg(image);
        }
        run(cmd).await
    }
}
