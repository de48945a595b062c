use async_trait::async_trait;
use chrono::Utc;
use dsa110_contracts::error::Result;
use dsa110_contracts::repository::QueuePort;
use dsa110_model::{ObservationGroup, ObservationGroupState};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Subband grouping queue repository implementing the
/// `collecting -> pending -> in_progress -> completed|failed` state machine
/// (spec §4.B).
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueuePort for QueueRepository {
    async fn upsert_group(&self, group: &ObservationGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO observation_groups
                (group_id, state, received_at, last_update, expected_subbands,
                 retry_count, processing_stage, chunk_minutes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(group_id) DO UPDATE SET
                state = excluded.state,
                last_update = excluded.last_update,
                expected_subbands = excluded.expected_subbands,
                retry_count = excluded.retry_count,
                processing_stage = excluded.processing_stage,
                chunk_minutes = excluded.chunk_minutes
            "#,
        )
        .bind(&group.group_id)
        .bind(group.state.as_str())
        .bind(group.received_at.to_rfc3339())
        .bind(group.last_update.to_rfc3339())
        .bind(group.expected_subbands as i64)
        .bind(group.retry_count as i64)
        .bind(&group.processing_stage)
        .bind(group.chunk_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claim the oldest `pending` group, ordered FIFO on
    /// `received_at` with `group_id` as the tie-break (spec §4.B). SQLite
    /// serializes writers, so a plain `UPDATE ... WHERE` inside a
    /// transaction is race-free: a second worker's update affects zero
    /// rows once the first has flipped the state.
    async fn acquire_next_pending(&self) -> Result<Option<ObservationGroup>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"SELECT group_id FROM observation_groups
               WHERE state = 'pending'
               ORDER BY received_at ASC, group_id ASC
               LIMIT 1"#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let group_id: String = row.get("group_id");

        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"UPDATE observation_groups
               SET state = 'in_progress', last_update = ?2
               WHERE group_id = ?1 AND state = 'pending'"#,
        )
        .bind(&group_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let group = fetch_group(&mut tx, &group_id).await?;
        tx.commit().await?;
        Ok(group)
    }

    async fn update_state(
        &self,
        group_id: &str,
        state: ObservationGroupState,
        processing_stage: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE observation_groups
               SET state = ?2, last_update = ?3, processing_stage = ?4
               WHERE group_id = ?1"#,
        )
        .bind(group_id)
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(processing_stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<ObservationGroup>> {
        let mut conn = self.pool.acquire().await?;
        fetch_group(&mut conn, group_id).await
    }

    async fn increment_retry(&self, group_id: &str) -> Result<u32> {
        sqlx::query(
            r#"UPDATE observation_groups
               SET retry_count = retry_count + 1, state = 'pending', last_update = ?2
               WHERE group_id = ?1"#,
        )
        .bind(group_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT retry_count FROM observation_groups WHERE group_id = ?1")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("retry_count") as u32)
    }
}

async fn fetch_group<'a, E>(executor: E, group_id: &str) -> Result<Option<ObservationGroup>>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"SELECT group_id, state, received_at, last_update, expected_subbands,
                  retry_count, processing_stage, chunk_minutes
           FROM observation_groups WHERE group_id = ?1"#,
    )
    .bind(group_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| {
        let state_str: String = r.get("state");
        let received_at: String = r.get("received_at");
        let last_update: String = r.get("last_update");
        ObservationGroup {
            group_id: r.get("group_id"),
            state: ObservationGroupState::from_str(&state_str).unwrap_or(ObservationGroupState::Failed),
            received_at: chrono::DateTime::parse_from_rfc3339(&received_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            last_update: chrono::DateTime::parse_from_rfc3339(&last_update)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            expected_subbands: r.get::<i64, _>("expected_subbands") as u32,
            retry_count: r.get::<i64, _>("retry_count") as u32,
            processing_stage: r.get("processing_stage"),
            chunk_minutes: r.get("chunk_minutes"),
        }
    }))
}

/// Compares two groups by the FIFO + tie-break ordering acquisition uses,
/// for use in in-memory sorting paths that don't go through SQL (spec
/// §4.B: "FIFO on `received_at`; among groups received in the same
/// second, sort lexicographically by `group_id`").
pub fn fifo_order(a: &ObservationGroup, b: &ObservationGroup) -> std::cmp::Ordering {
    a.received_at
        .cmp(&b.received_at)
        .then_with(|| a.group_id.cmp(&b.group_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, received_offset_secs: i64) -> ObservationGroup {
        ObservationGroup {
            group_id: id.to_string(),
            state: ObservationGroupState::Pending,
            received_at: Utc::now() + chrono::Duration::seconds(received_offset_secs),
            last_update: Utc::now(),
            expected_subbands: 16,
            retry_count: 0,
            processing_stage: None,
            chunk_minutes: None,
        }
    }

    #[test]
    fn fifo_order_breaks_ties_by_group_id() {
        let mut groups = vec![group("b", 0), group("a", 0)];
        groups.sort_by(fifo_order);
        assert_eq!(groups[0].group_id, "a");
    }

    #[test]
    fn fifo_order_prefers_earlier_received_at() {
        let mut groups = vec![group("z", 5), group("a", 0)];
        groups.sort_by(fifo_order);
        assert_eq!(groups[0].group_id, "a");
    }
}
