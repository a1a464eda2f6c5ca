//! The log seam the consumer is written against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RawEntry, StartPosition};

/// A partitioned append-only log with consumer groups.
///
/// Implemented by `PgEventLog` (postgres) and `MemoryEventLog` (tests).
/// Also implemented for `Arc<L>` so a log can be shared for assertions.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create `group` on `stream`. Fails with `LogError::GroupExists` when the
    /// group is already there; callers that want idempotence swallow it.
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()>;

    /// Deliver up to `count` entries never handed to this group before,
    /// waiting up to `block` for at least one. Delivered entries become
    /// pending for `consumer` until acknowledged.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>>;

    /// Remove entries from the group's pending list. Returns how many were
    /// actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<u64>;

    /// Drop entries from the stream itself (and from any pending list).
    async fn delete(&self, stream: &str, ids: &[i64]) -> Result<u64>;

    /// Append an entry, returning its position.
    async fn append(&self, stream: &str, fields: &HashMap<String, String>) -> Result<i64>;

    /// Transfer up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, oldest position first. Each claim bumps the entry's
    /// delivery count.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>>;

    /// Hand `consumer` its own pending entries again, up to `count`, oldest
    /// position first, regardless of idle time. Bumps each delivery count.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Arc<L> blanket
// ---------------------------------------------------------------------------

#[async_trait]
impl<L: EventLog + ?Sized> EventLog for Arc<L> {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()> {
        (**self).create_group(stream, group, start).await
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        (**self)
            .read_new(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<u64> {
        (**self).ack(stream, group, ids).await
    }

    async fn delete(&self, stream: &str, ids: &[i64]) -> Result<u64> {
        (**self).delete(stream, ids).await
    }

    async fn append(&self, stream: &str, fields: &HashMap<String, String>) -> Result<i64> {
        (**self).append(stream, fields).await
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        (**self)
            .claim_idle(stream, group, consumer, min_idle, count)
            .await
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        (**self).read_pending(stream, group, consumer, count).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        (**self).pending_count(stream, group).await
    }
}
