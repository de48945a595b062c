use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsa110_contracts::error::Result;
use dsa110_contracts::repository::DataRegistryPort;
use dsa110_model::{DataRecord, DataRelationship, FinalizationStatus, PublishMode};
use sqlx::{Row, SqlitePool};

/// Data registry repository: staging-to-published lifecycle and lineage
/// edges for every artifact the pipeline produces (spec §4.J).
#[derive(Clone)]
pub struct DataRegistryRepository {
    pool: SqlitePool,
}

impl DataRegistryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn status_str(status: FinalizationStatus) -> &'static str {
    match status {
        FinalizationStatus::Staged => "staged",
        FinalizationStatus::Published => "published",
        FinalizationStatus::Rejected => "rejected",
    }
}

fn parse_status(s: &str) -> FinalizationStatus {
    match s {
        "published" => FinalizationStatus::Published,
        "rejected" => FinalizationStatus::Rejected,
        _ => FinalizationStatus::Staged,
    }
}

fn publish_mode_str(mode: PublishMode) -> &'static str {
    match mode {
        PublishMode::Auto => "auto",
        PublishMode::Manual => "manual",
    }
}

fn parse_publish_mode(s: &str) -> PublishMode {
    match s {
        "manual" => PublishMode::Manual,
        _ => PublishMode::Auto,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> DataRecord {
    DataRecord {
        record_id: row.get("record_id"),
        product_type: row.get("product_type"),
        staging_path: row.get("staging_path"),
        published_path: row.get("published_path"),
        status: parse_status(&row.get::<String, _>("status")),
        publish_mode: row
            .get::<Option<String>, _>("publish_mode")
            .map(|s| parse_publish_mode(&s)),
        qa_status: row.get("qa_status"),
        validation_status: row.get("validation_status"),
        created_at: parse_rfc3339(&row.get::<String, _>("created_at")),
        published_at: row
            .get::<Option<String>, _>("published_at")
            .map(|s| parse_rfc3339(&s)),
    }
}

#[async_trait]
impl DataRegistryPort for DataRegistryRepository {
    async fn stage(&self, record: &DataRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_records
                (record_id, product_type, staging_path, published_path, status,
                 publish_mode, qa_status, validation_status, created_at, published_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(record_id) DO UPDATE SET
                staging_path = excluded.staging_path,
                product_type = excluded.product_type
            "#,
        )
        .bind(&record.record_id)
        .bind(&record.product_type)
        .bind(&record.staging_path)
        .bind(&record.published_path)
        .bind(status_str(record.status))
        .bind(record.publish_mode.map(publish_mode_str))
        .bind(&record.qa_status)
        .bind(&record.validation_status)
        .bind(record.created_at.to_rfc3339())
        .bind(record.published_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, record_id: &str) -> Result<Option<DataRecord>> {
        let row = sqlx::query(
            r#"SELECT record_id, product_type, staging_path, published_path, status,
                      publish_mode, qa_status, validation_status, created_at, published_at
               FROM data_records WHERE record_id = ?1"#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_record))
    }

    /// Finalize a record's QA/validation status and, if it now meets the
    /// auto-publish criteria, move it straight to `published` (spec §4.J
    /// steps 1-2). `qa_status`/`validation_status` columns are the only
    /// dynamic targets of the `UPDATE`, both drawn from this fixed list —
    /// never from caller-supplied column names.
    async fn finalize_data(
        &self,
        record_id: &str,
        qa_status: Option<&str>,
        validation_status: Option<&str>,
        auto_publish: bool,
        published_path: &str,
    ) -> Result<FinalizationStatus> {
        const ALLOWED_COLUMNS: [&str; 2] = ["qa_status", "validation_status"];
        let mut set_clauses = Vec::new();
        if qa_status.is_some() {
            set_clauses.push(ALLOWED_COLUMNS[0]);
        }
        if validation_status.is_some() {
            set_clauses.push(ALLOWED_COLUMNS[1]);
        }

        let mut tx = self.pool.begin().await?;

        if !set_clauses.is_empty() {
            let assignments = set_clauses
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{col} = ?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("UPDATE data_records SET {assignments} WHERE record_id = ?1");
            let mut q = sqlx::query(&sql).bind(record_id);
            if qa_status.is_some() {
                q = q.bind(qa_status);
            }
            if validation_status.is_some() {
                q = q.bind(validation_status);
            }
            q.execute(&mut *tx).await?;
        }

        let row = sqlx::query(
            r#"SELECT record_id, product_type, staging_path, published_path, status,
                      publish_mode, qa_status, validation_status, created_at, published_at
               FROM data_records WHERE record_id = ?1"#,
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Err(dsa110_contracts::error::PipelineError::from_message(format!(
                "database: no staged record {record_id}"
            )));
        };
        let record = row_to_record(row);

        let status = if auto_publish && record.meets_auto_publish_criteria() {
            sqlx::query(
                r#"UPDATE data_records
                   SET status = 'published', published_path = ?2, publish_mode = 'auto',
                       published_at = ?3
                   WHERE record_id = ?1"#,
            )
            .bind(record_id)
            .bind(published_path)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            FinalizationStatus::Published
        } else {
            FinalizationStatus::Staged
        };

        tx.commit().await?;
        Ok(status)
    }

    async fn publish(&self, record_id: &str, published_path: &str, mode: PublishMode) -> Result<()> {
        sqlx::query(
            r#"UPDATE data_records
               SET status = 'published', published_path = ?2, publish_mode = ?3, published_at = ?4
               WHERE record_id = ?1"#,
        )
        .bind(record_id)
        .bind(published_path)
        .bind(publish_mode_str(mode))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reject(&self, record_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE data_records SET status = 'rejected', validation_status = ?2 WHERE record_id = ?1"#,
        )
        .bind(record_id)
        .bind(format!("rejected: {reason}"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_relationship(&self, relationship: &DataRelationship) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO data_relationships (parent_id, child_id, relationship)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(parent_id, child_id, relationship) DO NOTHING"#,
        )
        .bind(&relationship.parent_id)
        .bind(&relationship.child_id)
        .bind(&relationship.relationship)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lineage(&self, record_id: &str) -> Result<Vec<DataRelationship>> {
        let rows = sqlx::query(
            r#"SELECT parent_id, child_id, relationship FROM data_relationships
               WHERE parent_id = ?1 OR child_id = ?1"#,
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| DataRelationship {
                parent_id: r.get("parent_id"),
                child_id: r.get("child_id"),
                relationship: r.get("relationship"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE data_records (
                record_id TEXT PRIMARY KEY, product_type TEXT, staging_path TEXT,
                published_path TEXT, status TEXT, publish_mode TEXT,
                qa_status TEXT, validation_status TEXT, created_at TEXT, published_at TEXT
            );
            CREATE TABLE data_relationships (
                parent_id TEXT, child_id TEXT, relationship TEXT,
                PRIMARY KEY (parent_id, child_id, relationship)
            );
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn record(id: &str, product_type: &str) -> DataRecord {
        DataRecord {
            record_id: id.to_string(),
            product_type: product_type.to_string(),
            staging_path: format!("/staging/{id}"),
            published_path: None,
            status: FinalizationStatus::Staged,
            publish_mode: None,
            qa_status: None,
            validation_status: None,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    #[tokio::test]
    async fn science_type_requires_passed_qa_to_auto_publish() {
        let repo = DataRegistryRepository::new(pool().await);
        repo.stage(&record("img-1", "image")).await.unwrap();

        let status = repo
            .finalize_data("img-1", None, Some("validated"), true, "/published/img-1")
            .await
            .unwrap();
        assert_eq!(status, FinalizationStatus::Staged);

        let status = repo
            .finalize_data("img-1", Some("passed"), Some("validated"), true, "/published/img-1")
            .await
            .unwrap();
        assert_eq!(status, FinalizationStatus::Published);
    }

    #[tokio::test]
    async fn non_science_type_auto_publishes_on_validation_alone() {
        let repo = DataRegistryRepository::new(pool().await);
        repo.stage(&record("raw-1", "hdf5_shard")).await.unwrap();
        let status = repo
            .finalize_data("raw-1", None, Some("validated"), true, "/published/raw-1")
            .await
            .unwrap();
        assert_eq!(status, FinalizationStatus::Published);
    }

    #[tokio::test]
    async fn manual_publish_skips_qa_gating() {
        let repo = DataRegistryRepository::new(pool().await);
        repo.stage(&record("img-2", "image")).await.unwrap();
        repo.publish("img-2", "/published/img-2", PublishMode::Manual)
            .await
            .unwrap();
        let fetched = repo.get("img-2").await.unwrap().unwrap();
        assert_eq!(fetched.status, FinalizationStatus::Published);
        assert_eq!(fetched.publish_mode, Some(PublishMode::Manual));
    }

    #[tokio::test]
    async fn lineage_returns_both_directions() {
        let repo = DataRegistryRepository::new(pool().await);
        repo.record_relationship(&DataRelationship {
            parent_id: "raw-1".to_string(),
            child_id: "ms-1".to_string(),
            relationship: "converted_from".to_string(),
        })
        .await
        .unwrap();
        let edges = repo.lineage("raw-1").await.unwrap();
        assert_eq!(edges.len(), 1);
        let edges = repo.lineage("ms-1").await.unwrap();
        assert_eq!(edges.len(), 1);
    }
}
