use dsa110_config::CalibrationConfig;

/// Per-antenna flagging statistics pulled from a prior calibration table,
/// as used to downrank unhealthy outriggers (spec §4.F step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntennaHealth {
    pub antenna_id: u32,
    pub flagged_fraction: f64,
}

/// Qualitative health bucket an antenna falls into given its flagged
/// fraction, matching the thresholds the original antenna-health analysis
/// used (excellent < 10%, good < 30%, fair otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
}

pub fn health_status(flagged_fraction: f64, cfg: &CalibrationConfig) -> HealthStatus {
    if flagged_fraction < cfg.refant_flagged_excellent {
        HealthStatus::Excellent
    } else if flagged_fraction < cfg.refant_flagged_good {
        HealthStatus::Good
    } else {
        HealthStatus::Fair
    }
}

/// Build the CASA-format refant string for a solve with no prior
/// calibration table to inspect: the bare priority chain (spec §4.F step
/// 4, "default outrigger chain").
pub fn default_refant_string(cfg: &CalibrationConfig) -> String {
    cfg.refant_priority
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Recommend a refant chain from a prior table's per-antenna health,
/// keeping priority order and dropping antennas whose flagged fraction is
/// at or above the `fair` threshold, then taking the top N (spec §4.F step
/// 4: "downrank antennas whose flagged fraction exceeds 50%... top-5
/// healthy antennas in priority order").
///
/// Antennas absent from `health` (no solutions recorded for them at all)
/// are treated as healthy and kept in their priority slot, since an
/// absent antenna in the table most often means it simply wasn't flagged.
pub fn recommend_refants(health: &[AntennaHealth], cfg: &CalibrationConfig) -> String {
    if health.is_empty() {
        return default_refant_string(cfg);
    }

    let healthy: Vec<u32> = cfg
        .refant_priority
        .iter()
        .copied()
        .filter(|id| {
            health
                .iter()
                .find(|h| h.antenna_id == *id)
                .map(|h| h.flagged_fraction < cfg.refant_flagged_fair)
                .unwrap_or(true)
        })
        .collect();

    if healthy.is_empty() {
        return default_refant_string(cfg);
    }

    healthy
        .into_iter()
        .take(cfg.top_n_refants)
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CalibrationConfig {
        CalibrationConfig::default()
    }

    #[test]
    fn no_health_data_returns_default_chain() {
        assert_eq!(recommend_refants(&[], &cfg()), default_refant_string(&cfg()));
    }

    #[test]
    fn unhealthy_leader_is_downranked() {
        let health = vec![
            AntennaHealth { antenna_id: 104, flagged_fraction: 0.9 },
            AntennaHealth { antenna_id: 105, flagged_fraction: 0.05 },
        ];
        let refants = recommend_refants(&health, &cfg());
        assert!(!refants.starts_with("104"));
        assert!(refants.split(',').next().unwrap() != "104");
    }

    #[test]
    fn result_is_capped_at_top_n() {
        let health: Vec<AntennaHealth> = cfg()
            .refant_priority
            .iter()
            .map(|id| AntennaHealth { antenna_id: *id, flagged_fraction: 0.0 })
            .collect();
        let refants = recommend_refants(&health, &cfg());
        assert_eq!(refants.split(',').count(), cfg().top_n_refants);
    }

    #[test]
    fn all_unhealthy_falls_back_to_default() {
        let health: Vec<AntennaHealth> = cfg()
            .refant_priority
            .iter()
            .map(|id| AntennaHealth { antenna_id: *id, flagged_fraction: 0.99 })
            .collect();
        assert_eq!(recommend_refants(&health, &cfg()), default_refant_string(&cfg()));
    }

    #[test]
    fn health_status_thresholds() {
        let c = cfg();
        assert_eq!(health_status(0.05, &c), HealthStatus::Excellent);
        assert_eq!(health_status(0.2, &c), HealthStatus::Good);
        assert_eq!(health_status(0.4, &c), HealthStatus::Fair);
    }
}
