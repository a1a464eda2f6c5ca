//! ReactionCache: per-note counters kept warm on the write path.
//!
//! The consumer bulk-writes totals right after every committed batch, so
//! staleness is bounded by the gap between commit and cache write rather than
//! by the TTL. Reads refresh the TTL: hot notes stay resident, cold ones age
//! out and are repaired from the repository on the next miss.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use notereact_common::{NoteCounts, ReactionError, Result};
use notereact_store::ReactionRepository;
use tracing::debug;

use crate::pipeline::PartitionedPipeline;
use crate::store::{CacheOp, CacheReply, CacheStore};

/// Cache key for a note's counters. The braces are the hash tag.
pub fn counts_key(note_id: &str) -> String {
    format!("note:{{{note_id}}}:reactions")
}

#[derive(Clone)]
pub struct ReactionCache {
    store: Arc<dyn CacheStore>,
    repository: Arc<dyn ReactionRepository>,
    ttl: Duration,
}

impl ReactionCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        repository: Arc<dyn ReactionRepository>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            repository,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached counters, loading from the repository on a miss. `None` when
    /// the note has no counters at all.
    pub async fn get_counts(&self, note_id: &str) -> Result<Option<NoteCounts>> {
        let key = counts_key(note_id);
        let replies = self
            .store
            .execute(
                self.store.partition_of(&key),
                vec![
                    CacheOp::HGetAll { key: key.clone() },
                    CacheOp::Expire {
                        key: key.clone(),
                        ttl: self.ttl,
                    },
                ],
            )
            .await?;

        if let Some(CacheReply::Hash(Some(fields))) = replies.first() {
            if !fields.is_empty() {
                return NoteCounts::from_fields(fields).map(Some);
            }
        }

        debug!(note_id, "Reaction cache miss");
        let loaded = self.repository.note_counts(note_id).await?;
        if let Some(counts) = &loaded {
            self.set_counts(note_id, counts).await?;
        }
        Ok(loaded)
    }

    /// Replace a note's cached counters and reset its TTL in one atomic
    /// partition execution.
    pub async fn set_counts(&self, note_id: &str, counts: &NoteCounts) -> Result<()> {
        let key = counts_key(note_id);
        let replies = self
            .store
            .execute(self.store.partition_of(&key), replace_ops(key, counts, self.ttl))
            .await?;
        expect_replies(&replies, 3)
    }

    /// Replace many notes' counters in one pipelined call, one concurrent
    /// sub-batch per partition.
    pub async fn bulk_set_counts(&self, counts: &BTreeMap<String, NoteCounts>) -> Result<()> {
        if counts.is_empty() {
            return Ok(());
        }
        let mut pipeline = PartitionedPipeline::new(self.store.as_ref());
        for (note_id, note_counts) in counts {
            for op in replace_ops(counts_key(note_id), note_counts, self.ttl) {
                pipeline.push(op);
            }
        }
        let replies = pipeline.execute().await?;
        expect_replies(&replies, counts.len() * 3)?;
        debug!(notes = counts.len(), "Reaction cache bulk set");
        Ok(())
    }

    /// Whether the note is cached. A hit also refreshes the TTL.
    pub async fn has_cache(&self, note_id: &str) -> Result<bool> {
        let key = counts_key(note_id);
        let replies = self
            .store
            .execute(
                self.store.partition_of(&key),
                vec![
                    CacheOp::Exists { key: key.clone() },
                    CacheOp::Expire { key, ttl: self.ttl },
                ],
            )
            .await?;
        Ok(matches!(replies.first(), Some(CacheReply::Flag(true))))
    }

    /// Remaining time to live of a cached note, if cached.
    pub async fn remaining_ttl(&self, note_id: &str) -> Result<Option<Duration>> {
        let key = counts_key(note_id);
        let replies = self
            .store
            .execute(self.store.partition_of(&key), vec![CacheOp::Ttl { key }])
            .await?;
        match replies.into_iter().next() {
            Some(CacheReply::Ttl(ttl)) => Ok(ttl),
            other => Err(ReactionError::Cache(format!("unexpected TTL reply: {other:?}"))),
        }
    }
}

/// Delete, write and expire: the hash ends up holding exactly `counts`.
fn replace_ops(key: String, counts: &NoteCounts, ttl: Duration) -> Vec<CacheOp> {
    vec![
        CacheOp::Del { key: key.clone() },
        CacheOp::HSet {
            key: key.clone(),
            fields: counts.to_fields(),
        },
        CacheOp::Expire { key, ttl },
    ]
}

fn expect_replies(replies: &[CacheReply], expected: usize) -> Result<()> {
    if replies.len() != expected {
        return Err(ReactionError::Cache(format!(
            "expected {expected} replies, got {}",
            replies.len()
        )));
    }
    Ok(())
}
