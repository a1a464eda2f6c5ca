//! The cache store seam: hash values with TTLs, spread over partitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notereact_common::Result;
use xxhash_rust::xxh3::xxh3_64;

/// One command against a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    /// Merge fields into the hash at `key`, creating it if needed.
    HSet {
        key: String,
        fields: HashMap<String, String>,
    },
    HGetAll {
        key: String,
    },
    /// Set the key's time to live. No-op on a missing key.
    Expire {
        key: String,
        ttl: Duration,
    },
    Exists {
        key: String,
    },
    Ttl {
        key: String,
    },
    Del {
        key: String,
    },
}

impl CacheOp {
    pub fn key(&self) -> &str {
        match self {
            CacheOp::HSet { key, .. }
            | CacheOp::HGetAll { key }
            | CacheOp::Expire { key, .. }
            | CacheOp::Exists { key }
            | CacheOp::Ttl { key }
            | CacheOp::Del { key } => key,
        }
    }
}

/// Reply to a [`CacheOp`], in the same position as the op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReply {
    /// `HSet`.
    Done,
    /// `HGetAll`; `None` when the key is missing or expired.
    Hash(Option<HashMap<String, String>>),
    /// `Expire`, `Exists`, `Del`: whether the key was there.
    Flag(bool),
    /// `Ttl`; `None` when the key is missing or has no expiry.
    Ttl(Option<Duration>),
}

/// A partitioned key/value store holding hashes.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn partition_count(&self) -> usize;

    fn partition_of(&self, key: &str) -> usize {
        partition_for(key, self.partition_count())
    }

    /// Run `ops` on one partition as a single atomic unit. Every op's key
    /// must belong to `partition`. Replies come back in op order.
    async fn execute(&self, partition: usize, ops: Vec<CacheOp>) -> Result<Vec<CacheReply>>;
}

#[async_trait]
impl<S: CacheStore + ?Sized> CacheStore for Arc<S> {
    fn partition_count(&self) -> usize {
        (**self).partition_count()
    }

    fn partition_of(&self, key: &str) -> usize {
        (**self).partition_of(key)
    }

    async fn execute(&self, partition: usize, ops: Vec<CacheOp>) -> Result<Vec<CacheReply>> {
        (**self).execute(partition, ops).await
    }
}

/// The part of a key that decides its partition: the text between the first
/// `{` and the following `}` when non-empty, otherwise the whole key.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

pub fn partition_for(key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (xxh3_64(hash_tag(key).as_bytes()) % partitions as u64) as usize
}
