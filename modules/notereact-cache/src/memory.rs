//! In-process partitioned cache store. Each partition is its own locked map,
//! so sub-batches for different partitions never contend. Expiry is lazy and
//! follows the tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use notereact_common::{ReactionError, Result};
use tokio::time::Instant;

use crate::store::{partition_for, CacheOp, CacheReply, CacheStore};

struct CacheEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Partition = HashMap<String, CacheEntry>;

pub struct MemoryCacheStore {
    partitions: Vec<Mutex<Partition>>,
    fail_next: AtomicU32,
}

impl MemoryCacheStore {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` partition executions.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of live keys across all partitions.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        (0..self.partitions.len())
            .map(|p| self.partition(p).values().filter(|e| e.is_live(now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition(&self, index: usize) -> MutexGuard<'_, Partition> {
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(map: &mut Partition, op: CacheOp, now: Instant) -> CacheReply {
        // Drop the entry up front if it has lapsed so every op sees it as missing.
        if map.get(op.key()).is_some_and(|e| !e.is_live(now)) {
            map.remove(op.key());
        }

        match op {
            CacheOp::HSet { key, fields } => {
                let entry = map.entry(key).or_insert_with(|| CacheEntry {
                    fields: HashMap::new(),
                    expires_at: None,
                });
                entry.fields.extend(fields);
                CacheReply::Done
            }
            CacheOp::HGetAll { key } => CacheReply::Hash(map.get(&key).map(|e| e.fields.clone())),
            CacheOp::Expire { key, ttl } => match map.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl);
                    CacheReply::Flag(true)
                }
                None => CacheReply::Flag(false),
            },
            CacheOp::Exists { key } => CacheReply::Flag(map.contains_key(&key)),
            CacheOp::Ttl { key } => CacheReply::Ttl(
                map.get(&key)
                    .and_then(|e| e.expires_at)
                    .map(|at| at.saturating_duration_since(now)),
            ),
            CacheOp::Del { key } => CacheReply::Flag(map.remove(&key).is_some()),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    async fn execute(&self, partition: usize, ops: Vec<CacheOp>) -> Result<Vec<CacheReply>> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReactionError::Cache(format!(
                "partition {partition} unavailable"
            )));
        }
        if partition >= self.partitions.len() {
            return Err(ReactionError::Cache(format!("no partition {partition}")));
        }
        if let Some(op) = ops
            .iter()
            .find(|op| partition_for(op.key(), self.partitions.len()) != partition)
        {
            return Err(ReactionError::Cache(format!(
                "key {:?} does not belong to partition {partition}",
                op.key()
            )));
        }

        let now = Instant::now();
        let mut map = self.partition(partition);
        Ok(ops
            .into_iter()
            .map(|op| Self::apply(&mut map, op, now))
            .collect())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(16)
    }
}
