use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`ObservationGroup`] (spec §4.B).
///
/// ```text
/// collecting --all 16 shards stored--> pending
/// pending    --worker acquires-------> in_progress
/// in_progress --stage sequence OK----> completed
/// in_progress --stage fails----------> failed
/// failed     --retry policy allows---> pending   (retry_count++)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationGroupState {
    Collecting,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ObservationGroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ObservationGroupState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collecting" => Ok(Self::Collecting),
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown observation group state: {other}")),
        }
    }
}

/// A row in the subband grouping queue (spec §3, component B).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationGroup {
    pub group_id: String,
    pub state: ObservationGroupState,
    pub received_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expected_subbands: u32,
    pub retry_count: u32,
    pub processing_stage: Option<String>,
    pub chunk_minutes: Option<f64>,
}
