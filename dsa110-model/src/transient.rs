use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a source's flux evolution across mosaic epochs
/// (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    New,
    Brightening,
    Fading,
    Variable,
}

/// Urgency assigned to a [`TransientAlert`], driving downstream notification
/// fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Medium,
    High,
    Critical,
}

/// A source flagged by the variability pipeline, with the statistics that
/// justified the classification (spec §4.H: V, eta, mean flux, modulation
/// index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientCandidate {
    pub source_name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub detection_type: DetectionType,
    pub variability_index: f64,
    pub chi_squared_eta: f64,
    pub mean_flux_jy: f64,
    pub modulation_index: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// An alert raised for a [`TransientCandidate`] that crossed a significance
/// threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientAlert {
    pub candidate: TransientCandidate,
    pub level: AlertLevel,
    pub raised_at: DateTime<Utc>,
    pub message: String,
}
