//! Partition-aware pipelining over a [`CacheStore`].

use std::collections::BTreeMap;

use futures::future::try_join_all;
use notereact_common::{ReactionError, Result};

use crate::store::{CacheOp, CacheReply, CacheStore};

/// Collects ops for many keys, then runs one sub-batch per partition
/// concurrently. Ops within a partition keep their relative order, and the
/// replies are returned in the order the ops were pushed.
pub struct PartitionedPipeline<'a, S: CacheStore + ?Sized> {
    store: &'a S,
    ops: Vec<CacheOp>,
}

impl<'a, S: CacheStore + ?Sized> PartitionedPipeline<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: CacheOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn execute(self) -> Result<Vec<CacheReply>> {
        let total = self.ops.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut groups: BTreeMap<usize, (Vec<usize>, Vec<CacheOp>)> = BTreeMap::new();
        for (position, op) in self.ops.into_iter().enumerate() {
            let (positions, ops) = groups.entry(self.store.partition_of(op.key())).or_default();
            positions.push(position);
            ops.push(op);
        }

        let store = self.store;
        let partition_runs = groups.into_iter().map(|(partition, (positions, ops))| async move {
            let expected = ops.len();
            let replies = store.execute(partition, ops).await?;
            if replies.len() != expected {
                return Err(ReactionError::Cache(format!(
                    "partition {partition} returned {} replies for {expected} ops",
                    replies.len()
                )));
            }
            Ok::<_, ReactionError>(positions.into_iter().zip(replies).collect::<Vec<_>>())
        });

        let mut ordered: Vec<Option<CacheReply>> = vec![None; total];
        for (position, reply) in try_join_all(partition_runs).await?.into_iter().flatten() {
            ordered[position] = Some(reply);
        }

        ordered
            .into_iter()
            .map(|reply| reply.ok_or_else(|| ReactionError::Cache("missing pipeline reply".into())))
            .collect()
    }
}
