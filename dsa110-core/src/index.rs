use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsa110_contracts::error::Result;
use dsa110_contracts::repository::FileIndexPort;
use dsa110_model::{IndexStats, IndexedFile};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::filename::{
    derive_group_id, expected_subband_codes, parse_shard_filename, DEFAULT_GROUP_TOLERANCE_SECONDS,
};

/// MJD for the Unix epoch, used to convert modification times to MJD
/// without depending on an external astrometry library for this one
/// conversion (spec §4.A: `timestamp_mjd`).
const MJD_UNIX_EPOCH: f64 = 40587.0;

fn unix_seconds_to_mjd(seconds: f64) -> f64 {
    MJD_UNIX_EPOCH + seconds / 86_400.0
}

/// `hdf5_file_index` repository: walks a watched directory, parses shard
/// filenames, and reconciles the durable index against the filesystem
/// (spec §4.A).
#[derive(Clone)]
pub struct FileIndexRepository {
    pool: SqlitePool,
    group_tolerance_seconds: u32,
}

impl FileIndexRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            group_tolerance_seconds: DEFAULT_GROUP_TOLERANCE_SECONDS,
        }
    }

    pub fn with_tolerance(mut self, seconds: u32) -> Self {
        self.group_tolerance_seconds = seconds;
        self
    }

    async fn existing_mtime(&self, path: &str) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT modified_time FROM hdf5_file_index WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<f64, _>("modified_time")))
    }
}

#[async_trait]
impl FileIndexPort for FileIndexRepository {
    /// Walk `input_dir`, parse every `.hdf5` shard, and upsert the index.
    /// Unchanged files (same mtime) are skipped unless `force_rescan`.
    /// Parse failures are counted, not raised (spec §4.A: "individual
    /// parse failures are counted and logged, not raised").
    async fn index(
        &self,
        input_dir: &Path,
        force_rescan: bool,
        max_files: Option<usize>,
    ) -> Result<IndexStats> {
        if !input_dir.is_dir() {
            return Err(dsa110_contracts::error::PipelineError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("input directory does not exist: {}", input_dir.display()),
                ),
            ));
        }

        let mut stats = IndexStats::default();
        let mut seen_paths = Vec::new();
        let mut batch = Vec::with_capacity(1000);

        for entry in WalkDir::new(input_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("hdf5") {
                continue;
            }
            if let Some(limit) = max_files {
                if stats.total_scanned >= limit {
                    break;
                }
            }
            stats.total_scanned += 1;

            let filename = match path.file_name().and_then(|f| f.to_str()) {
                Some(f) => f.to_string(),
                None => {
                    stats.errors += 1;
                    continue;
                }
            };

            let metadata = match std::fs::metadata(path) {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to stat shard file");
                    stats.errors += 1;
                    continue;
                }
            };
            let modified_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            let path_str = path.to_string_lossy().to_string();
            seen_paths.push(path_str.clone());

            let existing_mtime = self.existing_mtime(&path_str).await?;
            let is_new = existing_mtime.is_none();
            if !force_rescan {
                if let Some(existing_mtime) = existing_mtime {
                    if (existing_mtime - modified_time).abs() < f64::EPSILON {
                        stats.skipped += 1;
                        continue;
                    }
                }
            }

            let shard = match parse_shard_filename(&filename) {
                Ok(shard) => shard,
                Err(err) => {
                    debug!(%filename, %err, "shard filename did not parse");
                    stats.errors += 1;
                    continue;
                }
            };

            let group_id = derive_group_id(&shard.timestamp, self.group_tolerance_seconds);
            let timestamp_iso = shard.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
            let timestamp_mjd = unix_seconds_to_mjd(shard.timestamp.and_utc().timestamp() as f64);

            batch.push(IndexedFile {
                path: path_str,
                filename,
                group_id,
                subband_code: shard.subband_code,
                timestamp_iso,
                timestamp_mjd,
                file_size_bytes: metadata.len(),
                modified_time,
                indexed_at: Utc::now(),
                stored: true,
            });
            if is_new {
                stats.new_indexed += 1;
            } else {
                stats.updated += 1;
            }

            if batch.len() >= 1000 {
                self.upsert_many(&batch).await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.upsert_many(&batch).await?;
        }

        stats.deleted = self.mark_missing(&seen_paths).await?;
        Ok(stats)
    }

    async fn upsert_many(&self, files: &[IndexedFile]) -> Result<IndexStats> {
        let mut tx = self.pool.begin().await?;
        for file in files {
            sqlx::query(
                r#"
                INSERT INTO hdf5_file_index
                    (path, filename, group_id, subband_code, timestamp_iso,
                     timestamp_mjd, file_size_bytes, modified_time, indexed_at, stored)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)
                ON CONFLICT(path) DO UPDATE SET
                    filename = excluded.filename,
                    group_id = excluded.group_id,
                    subband_code = excluded.subband_code,
                    timestamp_iso = excluded.timestamp_iso,
                    timestamp_mjd = excluded.timestamp_mjd,
                    file_size_bytes = excluded.file_size_bytes,
                    modified_time = excluded.modified_time,
                    indexed_at = excluded.indexed_at,
                    stored = 1
                "#,
            )
            .bind(&file.path)
            .bind(&file.filename)
            .bind(&file.group_id)
            .bind(&file.subband_code)
            .bind(&file.timestamp_iso)
            .bind(file.timestamp_mjd)
            .bind(file.file_size_bytes as i64)
            .bind(file.modified_time)
            .bind(file.indexed_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(IndexStats::default())
    }

    async fn mark_missing(&self, seen_paths: &[String]) -> Result<usize> {
        let stored_rows =
            sqlx::query("SELECT path FROM hdf5_file_index WHERE stored = 1")
                .fetch_all(&self.pool)
                .await?;
        let seen: std::collections::HashSet<&str> =
            seen_paths.iter().map(|s| s.as_str()).collect();

        let mut missing = Vec::new();
        for row in stored_rows {
            let path: String = row.get("path");
            if !seen.contains(path.as_str()) {
                missing.push(path);
            }
        }

        let mut tx = self.pool.begin().await?;
        for path in &missing {
            sqlx::query("UPDATE hdf5_file_index SET stored = 0 WHERE path = ?1")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(missing.len())
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query(
            r#"SELECT path, filename, group_id, subband_code, timestamp_iso,
                      timestamp_mjd, file_size_bytes, modified_time, indexed_at, stored
               FROM hdf5_file_index
               WHERE group_id = ?1 AND stored = 1
               ORDER BY subband_code ASC"#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_indexed_file).collect())
    }

    async fn query_subband_groups(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        tolerance_s: f64,
        only_stored: bool,
    ) -> Result<Vec<Vec<String>>> {
        let window_start = (start_time - chrono::Duration::milliseconds((tolerance_s * 1000.0) as i64))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let window_end = (end_time + chrono::Duration::milliseconds((tolerance_s * 1000.0) as i64))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        let query = if only_stored {
            r#"SELECT group_id, subband_code, path, stored
               FROM hdf5_file_index
               WHERE timestamp_iso >= ?1 AND timestamp_iso <= ?2 AND stored = 1
               ORDER BY group_id ASC, subband_code ASC"#
        } else {
            r#"SELECT group_id, subband_code, path, stored
               FROM hdf5_file_index
               WHERE timestamp_iso >= ?1 AND timestamp_iso <= ?2
               ORDER BY group_id ASC, subband_code ASC"#
        };

        let rows = sqlx::query(query)
            .bind(&window_start)
            .bind(&window_end)
            .fetch_all(&self.pool)
            .await?;

        let mut by_group: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for row in rows {
            let group_id: String = row.get("group_id");
            let subband_code: String = row.get("subband_code");
            let path: String = row.get("path");
            by_group.entry(group_id).or_default().push((subband_code, path));
        }

        let expected: std::collections::HashSet<String> = expected_subband_codes(16).into_iter().collect();
        let mut groups = Vec::new();
        for (_, mut entries) in by_group {
            let codes: std::collections::HashSet<String> =
                entries.iter().map(|(code, _)| code.clone()).collect();
            if codes != expected {
                continue;
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            groups.push(entries.into_iter().map(|(_, path)| path).collect());
        }
        Ok(groups)
    }

    async fn is_group_complete(&self, group_id: &str, expected_subbands: u32) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT COUNT(DISTINCT subband_code) as n
               FROM hdf5_file_index
               WHERE group_id = ?1 AND stored = 1"#,
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("n");
        Ok(count as u32 >= expected_subbands)
    }
}

fn row_to_indexed_file(row: sqlx::sqlite::SqliteRow) -> IndexedFile {
    use chrono::DateTime;
    let indexed_at_str: String = row.get("indexed_at");
    IndexedFile {
        path: row.get("path"),
        filename: row.get("filename"),
        group_id: row.get("group_id"),
        subband_code: row.get("subband_code"),
        timestamp_iso: row.get("timestamp_iso"),
        timestamp_mjd: row.get("timestamp_mjd"),
        file_size_bytes: row.get::<i64, _>("file_size_bytes") as u64,
        modified_time: row.get("modified_time"),
        indexed_at: DateTime::parse_from_rfc3339(&indexed_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        stored: row.get::<i64, _>("stored") != 0,
    }
}

/// Group rows by `group_id` and count distinct subband codes, mirroring
/// `get_group_count` from the original indexer: a cheap, independently
/// testable building block for `query_subband_groups`/`is_group_complete`.
pub fn get_group_count(files: &[IndexedFile]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, std::collections::HashSet<&str>> = HashMap::new();
    for file in files {
        counts
            .entry(file.group_id.clone())
            .or_default()
            .insert(file.subband_code.as_str());
    }
    counts.into_iter().map(|(k, v)| (k, v.len())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsa110_model::IndexedFile;

    fn make_file(group_id: &str, subband: &str) -> IndexedFile {
        IndexedFile {
            path: format!("/data/{group_id}_{subband}.hdf5"),
            filename: format!("{group_id}_{subband}.hdf5"),
            group_id: group_id.to_string(),
            subband_code: subband.to_string(),
            timestamp_iso: group_id.to_string(),
            timestamp_mjd: 60000.0,
            file_size_bytes: 1024,
            modified_time: 0.0,
            indexed_at: Utc::now(),
            stored: true,
        }
    }

    #[test]
    fn group_count_counts_distinct_subbands() {
        let files = vec![
            make_file("g1", "sb00"),
            make_file("g1", "sb01"),
            make_file("g1", "sb01"),
            make_file("g2", "sb00"),
        ];
        let counts = get_group_count(&files);
        assert_eq!(counts["g1"], 2);
        assert_eq!(counts["g2"], 1);
    }
}
