use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use dsa110_contracts::error::Result;

/// The five SQLite-backed stores the pipeline writes to (spec §2, §6): the
/// file index, the grouping queue, the calibrator registry, the MS/
/// photometry/transient products store, and the data registry. Kept as
/// separate pools/files rather than one database so a stuck writer on one
/// never blocks the others under SQLite's single-writer model.
#[derive(Clone)]
pub struct Databases {
    pub index: SqlitePool,
    pub queue: SqlitePool,
    pub registry: SqlitePool,
    pub products: SqlitePool,
    pub data_registry: SqlitePool,
}

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(30));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

impl Databases {
    /// Open (and create if missing) all five pipeline databases from a
    /// [`dsa110_config::PipelineConfig`]'s configured paths.
    pub async fn open(config: &dsa110_config::PipelineConfig) -> Result<Self> {
        let dbs = Self {
            index: open_pool(&config.index_db).await?,
            queue: open_pool(&config.queue_db).await?,
            registry: open_pool(&config.registry_db).await?,
            products: open_pool(&config.products_db).await?,
            data_registry: open_pool(&config.data_registry_db).await?,
        };
        dbs.ensure_schema().await?;
        Ok(dbs)
    }

    /// Idempotent schema creation across all five databases, run on every
    /// startup so a fresh deployment and a restarted worker behave
    /// identically.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hdf5_file_index (
                path TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                group_id TEXT NOT NULL,
                subband_code TEXT NOT NULL,
                timestamp_iso TEXT NOT NULL,
                timestamp_mjd REAL NOT NULL,
                file_size_bytes INTEGER NOT NULL,
                modified_time REAL NOT NULL,
                indexed_at TEXT NOT NULL,
                stored INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_file_index_group
                ON hdf5_file_index(group_id, subband_code);
            "#,
        )
        .execute(&self.index)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observation_groups (
                group_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                received_at TEXT NOT NULL,
                last_update TEXT NOT NULL,
                expected_subbands INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                processing_stage TEXT,
                chunk_minutes REAL
            );
            CREATE INDEX IF NOT EXISTS idx_groups_state_received
                ON observation_groups(state, received_at);
            "#,
        )
        .execute(&self.queue)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calibrator_registrations (
                calibrator_name TEXT NOT NULL,
                observation_date TEXT NOT NULL,
                ra_deg REAL NOT NULL,
                dec_deg REAL NOT NULL,
                flux_jy REAL NOT NULL,
                spectral_index REAL,
                compactness REAL,
                catalog TEXT NOT NULL,
                quality_score REAL NOT NULL,
                transit_time TEXT NOT NULL,
                dec_range_min REAL NOT NULL,
                dec_range_max REAL NOT NULL,
                status TEXT NOT NULL,
                registered_by TEXT NOT NULL,
                notes TEXT,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (calibrator_name, observation_date)
            );
            CREATE TABLE IF NOT EXISTS calibrator_blacklist (
                name TEXT,
                ra_deg REAL,
                dec_deg REAL,
                radius_deg REAL NOT NULL,
                reason TEXT NOT NULL,
                blacklisted_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.registry)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ms_records (
                ms_path TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                calibrator_name TEXT,
                image_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS photometry_measurements (
                source_name TEXT NOT NULL,
                catalog TEXT NOT NULL,
                ra_deg REAL NOT NULL,
                dec_deg REAL NOT NULL,
                mosaic_id TEXT NOT NULL,
                flux_jy REAL NOT NULL,
                flux_err_jy REAL NOT NULL,
                observed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_photometry_source
                ON photometry_measurements(source_name, observed_at);
            CREATE TABLE IF NOT EXISTS transient_candidates (
                source_name TEXT PRIMARY KEY,
                ra_deg REAL NOT NULL,
                dec_deg REAL NOT NULL,
                detection_type TEXT NOT NULL,
                variability_index REAL NOT NULL,
                chi_squared_eta REAL NOT NULL,
                mean_flux_jy REAL NOT NULL,
                modulation_index REAL NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transient_alerts (
                source_name TEXT NOT NULL,
                level TEXT NOT NULL,
                raised_at TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS mosaic_groups (
                mosaic_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                output_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS mosaic_membership (
                mosaic_id TEXT NOT NULL,
                ms_path TEXT NOT NULL,
                sequence_index INTEGER NOT NULL,
                PRIMARY KEY (mosaic_id, ms_path)
            );
            "#,
        )
        .execute(&self.products)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_records (
                record_id TEXT PRIMARY KEY,
                product_type TEXT NOT NULL,
                staging_path TEXT NOT NULL,
                published_path TEXT,
                status TEXT NOT NULL,
                publish_mode TEXT,
                qa_status TEXT,
                validation_status TEXT,
                created_at TEXT NOT NULL,
                published_at TEXT
            );
            CREATE TABLE IF NOT EXISTS data_relationships (
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                relationship TEXT NOT NULL,
                PRIMARY KEY (parent_id, child_id, relationship)
            );
            "#,
        )
        .execute(&self.data_registry)
        .await?;

        Ok(())
    }
}
