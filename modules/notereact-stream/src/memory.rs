//! In-memory log for tests and local runs. Same delivery semantics as the
//! postgres log: per-group cursor, pending list, idle claim.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{LogError, Result};
use crate::log::EventLog;
use crate::types::{RawEntry, StartPosition};

#[derive(Default)]
struct StreamState {
    last_id: i64,
    entries: BTreeMap<i64, HashMap<String, String>>,
    groups: HashMap<String, GroupState>,
}

struct GroupState {
    last_delivered: i64,
    pending: BTreeMap<i64, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

/// In-memory event log. Thread-safe; blocking reads wake on append.
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every entry still in the stream, in position order (for test assertions).
    pub fn entries(&self, stream: &str) -> Vec<(i64, HashMap<String, String>)> {
        self.streams()
            .get(stream)
            .map(|s| s.entries.iter().map(|(id, f)| (*id, f.clone())).collect())
            .unwrap_or_default()
    }

    /// Ids pending for a group, with the consumer each is assigned to.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<(i64, String)> {
        self.streams()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (*id, p.consumer.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn try_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut streams = self.streams();
        let no_group = || LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(no_group)?;
        let group_state = state.groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let mut delivered = Vec::new();
        for (id, fields) in state.entries.range(group_state.last_delivered + 1..).take(count) {
            group_state.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(RawEntry {
                id: *id,
                fields: fields.clone(),
                delivery_count: 1,
            });
        }
        if let Some(last) = delivered.last() {
            group_state.last_delivered = last.id;
        }
        Ok(delivered)
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()> {
        let mut streams = self.streams();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(LogError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start {
            StartPosition::Beginning => 0,
            StartPosition::Latest => state.last_id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
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
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.try_read_new(stream, group, consumer, count)?;
            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_read_new(stream, group, consumer, count);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<u64> {
        let mut streams = self.streams();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn delete(&self, stream: &str, ids: &[i64]) -> Result<u64> {
        let mut streams = self.streams();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let mut deleted = 0;
        for id in ids {
            if state.entries.remove(id).is_some() {
                deleted += 1;
            }
            for group_state in state.groups.values_mut() {
                group_state.pending.remove(id);
            }
        }
        Ok(deleted)
    }

    async fn append(&self, stream: &str, fields: &HashMap<String, String>) -> Result<i64> {
        let id = {
            let mut streams = self.streams();
            let state = streams.entry(stream.to_string()).or_default();
            state.last_id += 1;
            state.entries.insert(state.last_id, fields.clone());
            state.last_id
        };
        self.appended.notify_waiters();
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
        let mut streams = self.streams();
        let no_group = || LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(no_group)?;
        let group_state = state.groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = state.entries.get(id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(RawEntry {
                id: *id,
                fields: fields.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut streams = self.streams();
        let no_group = || LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(no_group)?;
        let group_state = state.groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let mut redelivered = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if redelivered.len() >= count {
                break;
            }
            if pending.consumer != consumer {
                continue;
            }
            let Some(fields) = state.entries.get(id) else {
                continue;
            };
            pending.delivered_at = now;
            pending.delivery_count += 1;
            redelivered.push(RawEntry {
                id: *id,
                fields: fields.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(redelivered)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let streams = self.streams();
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }
}
