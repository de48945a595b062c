use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsa110_model::{
    CalibratorBlacklistEntry, CalibratorRegistration, DataRecord, DataRelationship,
    FinalizationStatus, IndexStats, IndexedFile, MosaicGroup, MosaicMembership, MsRecord,
    ObservationGroup, ObservationGroupState, PhotometryMeasurement, PublishMode,
    TransientAlert, TransientCandidate,
};

use crate::error::Result;

/// Port over the `hdf5_file_index` database (spec §4.A).
#[async_trait]
pub trait FileIndexPort: Send + Sync {
    /// Walk `input_dir`, parse every UVH5 shard, and reconcile the durable
    /// index against the filesystem (spec §4.A `index`).
    async fn index(
        &self,
        input_dir: &std::path::Path,
        force_rescan: bool,
        max_files: Option<usize>,
    ) -> Result<IndexStats>;
    async fn upsert_many(&self, files: &[IndexedFile]) -> Result<IndexStats>;
    async fn mark_missing(&self, paths: &[String]) -> Result<usize>;
    async fn get_group(&self, group_id: &str) -> Result<Vec<IndexedFile>>;
    /// Cluster indexed shards by midtime within `tolerance_s` of each other
    /// inside `[start_time, end_time]`, returning each complete
    /// (`{sb00..sb15}`) group's file paths sorted by subband code. When
    /// `only_stored` is set, only groups whose files are all still present
    /// on disk are returned (spec §4.A `query_subband_groups`).
    async fn query_subband_groups(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        tolerance_s: f64,
        only_stored: bool,
    ) -> Result<Vec<Vec<String>>>;
    async fn is_group_complete(&self, group_id: &str, expected_subbands: u32) -> Result<bool>;
}

/// Port over the subband grouping queue database (spec §4.B).
#[async_trait]
pub trait QueuePort: Send + Sync {
    async fn upsert_group(&self, group: &ObservationGroup) -> Result<()>;
    async fn acquire_next_pending(&self) -> Result<Option<ObservationGroup>>;
    async fn update_state(
        &self,
        group_id: &str,
        state: ObservationGroupState,
        processing_stage: Option<&str>,
    ) -> Result<()>;
    async fn get_group(&self, group_id: &str) -> Result<Option<ObservationGroup>>;
    async fn increment_retry(&self, group_id: &str) -> Result<u32>;
}

/// Port over the calibrator registry database (spec §4.C).
#[async_trait]
pub trait CalibratorRegistryPort: Send + Sync {
    async fn register(&self, registration: &CalibratorRegistration) -> Result<()>;
    async fn get_for_date(&self, observation_date: &str) -> Result<Option<CalibratorRegistration>>;
    async fn blacklist(&self, entry: &CalibratorBlacklistEntry) -> Result<()>;
    async fn blacklist_entries(&self) -> Result<Vec<CalibratorBlacklistEntry>>;
    async fn transit_time(
        &self,
        calibrator_name: &str,
        date: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>>;
}

/// Port over the products database: measurement sets, photometry, and
/// transient candidates (spec §4.D-H).
#[async_trait]
pub trait ProductsPort: Send + Sync {
    async fn upsert_ms(&self, record: &MsRecord) -> Result<()>;
    async fn get_ms(&self, ms_path: &str) -> Result<Option<MsRecord>>;
    async fn insert_photometry(&self, measurements: &[PhotometryMeasurement]) -> Result<()>;
    async fn photometry_history(&self, source_name: &str) -> Result<Vec<PhotometryMeasurement>>;
    async fn upsert_transient(&self, candidate: &TransientCandidate) -> Result<()>;
    async fn record_alert(&self, alert: &TransientAlert) -> Result<()>;
    async fn upsert_mosaic(&self, mosaic: &MosaicGroup) -> Result<()>;
    async fn add_mosaic_member(&self, membership: &MosaicMembership) -> Result<()>;
}

/// Port over the data registry database: staged/published lineage
/// (spec §4.J).
#[async_trait]
pub trait DataRegistryPort: Send + Sync {
    async fn stage(&self, record: &DataRecord) -> Result<()>;
    async fn get(&self, record_id: &str) -> Result<Option<DataRecord>>;
    /// Record QA/validation status and mark `finalized`; if `auto_publish`
    /// is enabled and the record now meets the auto-publish criteria, also
    /// move it to `published` (spec §4.J steps 1-2).
    async fn finalize_data(
        &self,
        record_id: &str,
        qa_status: Option<&str>,
        validation_status: Option<&str>,
        auto_publish: bool,
        published_path: &str,
    ) -> Result<FinalizationStatus>;
    async fn publish(&self, record_id: &str, published_path: &str, mode: PublishMode) -> Result<()>;
    async fn reject(&self, record_id: &str, reason: &str) -> Result<()>;
    async fn record_relationship(&self, relationship: &DataRelationship) -> Result<()>;
    async fn lineage(&self, record_id: &str) -> Result<Vec<DataRelationship>>;
}
