//! PgCacheStore: the partitioned hash store kept in a shared Postgres table,
//! so every consumer process and every reader sees the same counters.
//!
//! One `execute` call is one transaction holding the partition's advisory
//! lock, which gives each partition the same one-at-a-time semantics as a
//! cache node running a pipelined `MULTI`. Expiry is a timestamp compared
//! against the transaction clock; lapsed rows read as missing until evicted.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notereact_common::{ReactionError, Result};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::store::{partition_for, CacheOp, CacheReply, CacheStore};

/// First key of the advisory locks taken per partition.
const LOCK_CLASS: i32 = 0x6e72_6361;

/// Whether a row has not expired yet, relative to the transaction clock.
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
    partitions: usize,
}

impl PgCacheStore {
    pub fn new(pool: PgPool, partitions: usize) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ReactionError::Database(e.into()))?;
        Ok(())
    }

    /// Delete expired entries.
    pub async fn evict_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn apply(conn: &mut PgConnection, partition: usize, op: CacheOp) -> Result<CacheReply> {
        let reply = match op {
            CacheOp::HSet { key, fields } => {
                // A lapsed row is replaced rather than merged into.
                sqlx::query(
                    r#"
                    INSERT INTO cache_entries (key, partition, fields)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (key) DO UPDATE SET
                        fields = CASE
                            WHEN cache_entries.expires_at <= now() THEN EXCLUDED.fields
                            ELSE cache_entries.fields || EXCLUDED.fields
                        END,
                        expires_at = CASE
                            WHEN cache_entries.expires_at <= now() THEN NULL
                            ELSE cache_entries.expires_at
                        END,
                        partition = EXCLUDED.partition,
                        updated_at = now()
                    "#,
                )
                .bind(&key)
                .bind(partition as i32)
                .bind(Json(&fields))
                .execute(&mut *conn)
                .await?;
                CacheReply::Done
            }
            CacheOp::HGetAll { key } => {
                let row = sqlx::query_as::<_, (Json<Value>,)>(&format!(
                    "SELECT fields FROM cache_entries WHERE key = $1 AND {LIVE}"
                ))
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;
                CacheReply::Hash(row.map(|(Json(fields),)| string_fields(fields)))
            }
            CacheOp::Expire { key, ttl } => {
                let result = sqlx::query(&format!(
                    r#"
                    UPDATE cache_entries
                    SET expires_at = now() + make_interval(secs => $2::float8)
                    WHERE key = $1 AND {LIVE}
                    "#
                ))
                .bind(&key)
                .bind(ttl.as_secs_f64())
                .execute(&mut *conn)
                .await?;
                CacheReply::Flag(result.rows_affected() > 0)
            }
            CacheOp::Exists { key } => {
                let (exists,) = sqlx::query_as::<_, (bool,)>(&format!(
                    "SELECT EXISTS (SELECT 1 FROM cache_entries WHERE key = $1 AND {LIVE})"
                ))
                .bind(&key)
                .fetch_one(&mut *conn)
                .await?;
                CacheReply::Flag(exists)
            }
            CacheOp::Ttl { key } => {
                let row = sqlx::query_as::<_, (Option<DateTime<Utc>>, DateTime<Utc>)>(&format!(
                    "SELECT expires_at, now() FROM cache_entries WHERE key = $1 AND {LIVE}"
                ))
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;
                CacheReply::Ttl(row.and_then(|(expires_at, now)| {
                    expires_at.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                }))
            }
            CacheOp::Del { key } => {
                let row = sqlx::query_as::<_, (bool,)>(&format!(
                    "DELETE FROM cache_entries WHERE key = $1 RETURNING {LIVE}"
                ))
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;
                CacheReply::Flag(row.is_some_and(|(live,)| live))
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    fn partition_count(&self) -> usize {
        self.partitions
    }

    async fn execute(&self, partition: usize, ops: Vec<CacheOp>) -> Result<Vec<CacheReply>> {
        if partition >= self.partitions {
            return Err(ReactionError::Cache(format!("no partition {partition}")));
        }
        if let Some(op) = ops
            .iter()
            .find(|op| partition_for(op.key(), self.partitions) != partition)
        {
            return Err(ReactionError::Cache(format!(
                "key {:?} does not belong to partition {partition}",
                op.key()
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(partition as i32)
            .execute(&mut *tx)
            .await?;

        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            replies.push(Self::apply(&mut tx, partition, op).await?);
        }
        tx.commit().await?;

        debug!(partition, ops = replies.len(), "Cache partition executed");
        Ok(replies)
    }
}

/// Hash fields as strings. Values written here are always strings; anything
/// else is rendered as its JSON text rather than failing the read.
fn string_fields(value: Value) -> HashMap<String, String> {
    let Value::Object(map) = value else {
        return HashMap::new();
    };
    map.into_iter()
        .map(|(name, value)| match value {
            Value::String(s) => (name, s),
            other => (name, other.to_string()),
        })
        .collect()
}
