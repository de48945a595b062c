use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dsa110_contracts::error::Result;
use dsa110_contracts::external::ExternalMosaicBuilder;
use dsa110_model::{MosaicGroup, MosaicMembership, MosaicStatus};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Measurement sets per mosaic window (spec §4.I: "most recent 10 imaged
/// MSes").
const WINDOW_SIZE: usize = 10;
/// MSes carried over from the previous mosaic's tail (spec §4.I: "2-MS
/// overlap").
const OVERLAP_SIZE: usize = 2;
/// Default time window searched for candidate MSes around the trigger MS.
const DEFAULT_WINDOW_MINUTES: i64 = 120;

/// An imaged MS eligible to join a mosaic: its path and image midtime.
#[derive(Debug, Clone)]
pub struct ImagedMs {
    pub ms_path: String,
    pub midtime: DateTime<Utc>,
}

/// Drives the sliding-window mosaic trigger: on every newly imaged MS,
/// decide whether enough MSes have accumulated to form a new mosaic group
/// (spec §4.I).
pub struct MosaicTrigger {
    pool: SqlitePool,
    builder: Arc<dyn ExternalMosaicBuilder>,
    window: Duration,
}

impl MosaicTrigger {
    pub fn new(pool: SqlitePool, builder: Arc<dyn ExternalMosaicBuilder>) -> Self {
        Self {
            pool,
            builder,
            window: Duration::minutes(DEFAULT_WINDOW_MINUTES),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Query imaged MSes within `self.window` of `trigger.midtime`,
    /// ordered by midtime, excluding anything already in a `completed` or
    /// still-active (`collecting`/`ready`/`building`) mosaic group (spec
    /// §4.I steps 1-2).
    async fn candidate_mses(&self, trigger: &ImagedMs) -> Result<Vec<ImagedMs>> {
        let lower = (trigger.midtime - self.window).to_rfc3339();
        let upper = (trigger.midtime + self.window).to_rfc3339();

        let rows = sqlx::query(
            r#"SELECT ms_path, updated_at FROM ms_records
               WHERE stage = 'imaged' AND updated_at BETWEEN ?1 AND ?2
               ORDER BY updated_at ASC"#,
        )
        .bind(&lower)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await?;

        let excluded = self.excluded_ms_paths().await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let ms_path: String = r.get("ms_path");
                if excluded.contains(&ms_path) {
                    return None;
                }
                let updated_at: String = r.get("updated_at");
                Some(ImagedMs {
                    ms_path,
                    midtime: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or(trigger.midtime),
                })
            })
            .collect())
    }

    async fn excluded_ms_paths(&self) -> Result<std::collections::HashSet<String>> {
        let rows = sqlx::query(
            r#"SELECT mm.ms_path, mg.status FROM mosaic_membership mm
               JOIN mosaic_groups mg ON mg.mosaic_id = mm.mosaic_id
               WHERE mg.status != 'failed'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("ms_path")).collect())
    }

    /// The 2 most recent members of the most recently completed mosaic, if
    /// any exists, used to seed the next window's overlap.
    async fn previous_mosaic_tail(&self) -> Result<Vec<String>> {
        let row = sqlx::query(
            r#"SELECT mosaic_id FROM mosaic_groups
               WHERE status = 'completed'
               ORDER BY updated_at DESC LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(Vec::new()) };
        let mosaic_id: String = row.get("mosaic_id");

        let rows = sqlx::query(
            r#"SELECT ms_path FROM mosaic_membership
               WHERE mosaic_id = ?1
               ORDER BY sequence_index DESC LIMIT ?2"#,
        )
        .bind(&mosaic_id)
        .bind(OVERLAP_SIZE as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut tail: Vec<String> = rows.into_iter().map(|r| r.get("ms_path")).collect();
        tail.reverse();
        Ok(tail)
    }

    /// Evaluate whether a new mosaic should form around `trigger`, and if
    /// so, drive it through `ready -> building -> completed|failed` (spec
    /// §4.I steps 3-4). Returns `None` if the window isn't full yet.
    pub async fn on_ms_imaged(&self, trigger: &ImagedMs) -> Result<Option<MosaicGroup>> {
        let candidates = self.candidate_mses(trigger).await?;
        let overlap = self.previous_mosaic_tail().await?;

        // `candidates` never includes `overlap`'s MSes: they already
        // belong to the completed mosaic that produced the tail, so
        // `excluded_ms_paths` filtered them out.
        if overlap.len() + candidates.len() < WINDOW_SIZE {
            return Ok(None);
        }

        let mut window_members: Vec<String> = overlap;
        window_members.extend(candidates.iter().map(|c| c.ms_path.clone()));
        window_members.truncate(WINDOW_SIZE);

        let mosaic_id = format!("mosaic-{}", Uuid::new_v4());
        let now = Utc::now();
        let window_start = candidates
            .first()
            .map(|c| c.midtime)
            .unwrap_or(trigger.midtime);
        let window_end = trigger.midtime;

        let mut group = MosaicGroup {
            mosaic_id: mosaic_id.clone(),
            status: MosaicStatus::Ready,
            window_start,
            window_end,
            output_path: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_group(&group).await?;
        for (i, ms_path) in window_members.iter().enumerate() {
            self.persist_member(&mosaic_id, ms_path, i as u32).await?;
        }

        group.status = MosaicStatus::Building;
        group.updated_at = Utc::now();
        self.persist_group(&group).await?;

        let paths: Vec<&Path> = window_members.iter().map(|p| Path::new(p.as_str())).collect();
        let output_path = Path::new(&mosaic_id).with_extension("mosaic");
        match self.builder.build(&paths, &output_path).await {
            Ok(()) => {
                group.status = MosaicStatus::Completed;
                group.output_path = Some(output_path.display().to_string());
            }
            Err(_err) => {
                group.status = MosaicStatus::Failed;
            }
        }
        group.updated_at = Utc::now();
        self.persist_group(&group).await?;

        Ok(Some(group))
    }

    async fn persist_group(&self, group: &MosaicGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mosaic_groups
                (mosaic_id, status, window_start, window_end, output_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(mosaic_id) DO UPDATE SET
                status = excluded.status,
                output_path = excluded.output_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&group.mosaic_id)
        .bind(mosaic_status_as_str(group.status))
        .bind(group.window_start.to_rfc3339())
        .bind(group.window_end.to_rfc3339())
        .bind(&group.output_path)
        .bind(group.created_at.to_rfc3339())
        .bind(group.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_member(&self, mosaic_id: &str, ms_path: &str, sequence_index: u32) -> Result<()> {
        let membership = MosaicMembership {
            mosaic_id: mosaic_id.to_string(),
            ms_path: ms_path.to_string(),
            sequence_index,
        };
        sqlx::query(
            r#"INSERT INTO mosaic_membership (mosaic_id, ms_path, sequence_index)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(mosaic_id, ms_path) DO UPDATE SET sequence_index = excluded.sequence_index"#,
        )
        .bind(&membership.mosaic_id)
        .bind(&membership.ms_path)
        .bind(membership.sequence_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn mosaic_status_as_str(status: MosaicStatus) -> &'static str {
    match status {
        MosaicStatus::Collecting => "collecting",
        MosaicStatus::Ready => "ready",
        MosaicStatus::Building => "building",
        MosaicStatus::Completed => "completed",
        MosaicStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubBuilder;

    #[async_trait]
    impl ExternalMosaicBuilder for StubBuilder {
        async fn build(&self, _image_paths: &[&Path], _output: &Path) -> Result<()> {
            Ok(())
        }
    }

    async fn pool_with_schema() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE ms_records (
                ms_path TEXT PRIMARY KEY, group_id TEXT, stage TEXT, calibrator_name TEXT,
                image_path TEXT, created_at TEXT, updated_at TEXT
            );
            CREATE TABLE mosaic_groups (
                mosaic_id TEXT PRIMARY KEY, status TEXT, window_start TEXT, window_end TEXT,
                output_path TEXT, created_at TEXT, updated_at TEXT
            );
            CREATE TABLE mosaic_membership (
                mosaic_id TEXT, ms_path TEXT, sequence_index INTEGER,
                PRIMARY KEY (mosaic_id, ms_path)
            );
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    async fn insert_imaged_ms(pool: &SqlitePool, path: &str, midtime: DateTime<Utc>) {
        sqlx::query(
            "INSERT INTO ms_records (ms_path, group_id, stage, created_at, updated_at) VALUES (?1, 'g', 'imaged', ?2, ?2)",
        )
        .bind(path)
        .bind(midtime.to_rfc3339())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fewer_than_window_size_candidates_does_not_trigger() {
        let pool = pool_with_schema().await;
        let base = Utc::now();
        for i in 0..5 {
            insert_imaged_ms(&pool, &format!("ms{i}"), base + Duration::minutes(i)).await;
        }
        let trigger = MosaicTrigger::new(pool, Arc::new(StubBuilder));
        let result = trigger
            .on_ms_imaged(&ImagedMs { ms_path: "ms4".to_string(), midtime: base + Duration::minutes(4) })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn ten_candidates_form_a_completed_mosaic() {
        let pool = pool_with_schema().await;
        let base = Utc::now();
        for i in 0..10 {
            insert_imaged_ms(&pool, &format!("ms{i}"), base + Duration::minutes(i)).await;
        }
        let trigger = MosaicTrigger::new(pool, Arc::new(StubBuilder));
        let result = trigger
            .on_ms_imaged(&ImagedMs { ms_path: "ms9".to_string(), midtime: base + Duration::minutes(9) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, MosaicStatus::Completed);
    }
}
