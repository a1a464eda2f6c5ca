//! PgEventLog: consumer-group log backed by Postgres.
//!
//! Positions are gap-free per stream: appends take the stream's row lock to
//! claim the next id, so ids commit in order and a group cursor can move past
//! an id only once everything below it is visible.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{LogError, Result};
use crate::log::EventLog;
use crate::types::{RawEntry, StartPosition};

/// How often a blocking read re-checks for new entries.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }

    async fn try_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut tx = self.pool.begin().await?;

        // Locking the cursor row serializes readers within a group, which is
        // what gives each entry to exactly one member.
        let cursor = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT last_delivered_id
            FROM stream_groups
            WHERE stream = $1 AND group_name = $2
            FOR UPDATE
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let rows = sqlx::query_as::<_, (i64, Json<Value>)>(
            r#"
            SELECT id, fields
            FROM stream_entries
            WHERE stream = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(cursor.0)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let Some(last_id) = rows.last().map(|(id, _)| *id) else {
            tx.rollback().await?;
            return Ok(Vec::new());
        };
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();

        sqlx::query(
            r#"
            INSERT INTO stream_pending (stream, group_name, entry_id, consumer)
            SELECT $1, $2, entry_id, $4
            FROM UNNEST($3::bigint[]) AS t(entry_id)
            ON CONFLICT (stream, group_name, entry_id) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(&ids)
        .bind(consumer)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE stream_groups
            SET last_delivered_id = $3
            WHERE stream = $1 AND group_name = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(last_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|(id, Json(fields))| RawEntry {
                id,
                fields: flatten_fields(id, fields),
                delivery_count: 1,
            })
            .collect())
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO stream_groups (stream, group_name, last_delivered_id)
            VALUES (
                $1,
                $2,
                CASE WHEN $3 THEN COALESCE((SELECT last_id FROM streams WHERE name = $1), 0)
                     ELSE 0
                END
            )
            ON CONFLICT (stream, group_name) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(start == StartPosition::Latest)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LogError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let entries = self.try_read_new(stream, group, consumer, count).await?;
            let now = tokio::time::Instant::now();
            if !entries.is_empty() || now >= deadline {
                return Ok(entries);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM stream_pending
            WHERE stream = $1 AND group_name = $2 AND entry_id = ANY($3)
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, stream: &str, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM stream_pending WHERE stream = $1 AND entry_id = ANY($2)")
            .bind(stream)
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM stream_entries WHERE stream = $1 AND id = ANY($2)")
            .bind(stream)
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn append(&self, stream: &str, fields: &HashMap<String, String>) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let (id,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO streams (name, last_id)
            VALUES ($1, 1)
            ON CONFLICT (name) DO UPDATE SET last_id = streams.last_id + 1
            RETURNING last_id
            "#,
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO stream_entries (stream, id, fields) VALUES ($1, $2, $3)")
            .bind(stream)
            .bind(id)
            .bind(Json(fields))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(stream, id, "Appended log entry");
        Ok(id)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let rows = sqlx::query_as::<_, (i64, Json<Value>, i32)>(
            r#"
            WITH idle AS (
                SELECT entry_id
                FROM stream_pending
                WHERE stream = $1
                  AND group_name = $2
                  AND delivered_at <= now() - make_interval(secs => $4::float8)
                ORDER BY entry_id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE stream_pending p
                SET consumer = $3,
                    delivered_at = now(),
                    delivery_count = p.delivery_count + 1
                FROM idle
                WHERE p.stream = $1 AND p.group_name = $2 AND p.entry_id = idle.entry_id
                RETURNING p.entry_id, p.delivery_count
            )
            SELECT e.id, e.fields, c.delivery_count
            FROM claimed c
            JOIN stream_entries e ON e.stream = $1 AND e.id = c.entry_id
            ORDER BY e.id ASC
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .bind(min_idle.as_secs_f64())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(redelivered(rows))
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let rows = sqlx::query_as::<_, (i64, Json<Value>, i32)>(
            r#"
            WITH own AS (
                SELECT entry_id
                FROM stream_pending
                WHERE stream = $1 AND group_name = $2 AND consumer = $3
                ORDER BY entry_id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            ),
            redelivered AS (
                UPDATE stream_pending p
                SET delivered_at = now(),
                    delivery_count = p.delivery_count + 1
                FROM own
                WHERE p.stream = $1 AND p.group_name = $2 AND p.entry_id = own.entry_id
                RETURNING p.entry_id, p.delivery_count
            )
            SELECT e.id, e.fields, r.delivery_count
            FROM redelivered r
            JOIN stream_entries e ON e.stream = $1 AND e.id = r.entry_id
            ORDER BY e.id ASC
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(redelivered(rows))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let (count,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM stream_pending WHERE stream = $1 AND group_name = $2",
        )
        .bind(stream)
        .bind(group)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn redelivered(rows: Vec<(i64, Json<Value>, i32)>) -> Vec<RawEntry> {
    rows.into_iter()
        .map(|(id, Json(fields), delivery_count)| RawEntry {
            id,
            fields: flatten_fields(id, fields),
            delivery_count: u32::try_from(delivery_count).unwrap_or(0),
        })
        .collect()
}

/// Flatten a stored JSONB payload into string fields. Scalars are rendered
/// as text, nulls are dropped and nested values keep their JSON text. A
/// payload that is not an object yields no fields, so the entry is still
/// delivered and the consumer can settle it as malformed.
fn flatten_fields(id: i64, value: Value) -> HashMap<String, String> {
    let Value::Object(map) = value else {
        warn!(entry_id = id, "Log entry payload is not an object");
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(name, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
            };
            Some((name, text))
        })
        .collect()
}
