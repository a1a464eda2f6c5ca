//! StreamConsumer: drains one shard of the reaction log.
//!
//! Each cycle reads a batch, drops malformed entries, collapses the rest to
//! one decision per (note, user) and hands that to the repository in one
//! transaction. Fresh totals go to the cache before anything is acked, so an
//! entry is only ever acknowledged once both writes have landed.
//!
//! Failed entries are not re-appended. They stay pending in the consumer
//! group under their original position and the consumer goes into backlog:
//! later cycles redeliver its own pending entries first and read nothing new
//! until they settle, so a newer event for the same note and user can never
//! be applied ahead of an older one that failed. The log's delivery count
//! is the attempt counter; past `max_retries` an entry is copied to the
//! dead-letter log and acked, which releases the backlog.
//!
//! Entries orphaned by a dead consumer are claimed by the reclaim pass once
//! they have sat idle for `reclaim_min_idle`.
//!
//! Re-applying a batch is safe: the repository diffs against stored state,
//! so a redelivered batch that already committed produces no writes and no
//! deltas, and the cache is rewritten from the re-read totals.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use futures::FutureExt;
use notereact_cache::ReactionCache;
use notereact_common::{BulkApplyOutcome, NotesMap};
use notereact_store::ReactionRepository;
use notereact_stream::{EventLog, LogError, RawEntry, StartPosition, StreamKeys};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::event::ReactionEvent;
use crate::reduce::reduce;

/// Dead-letter fields added to the original entry's fields.
pub const DLQ_ORIGINAL_ID: &str = "originalId";
pub const DLQ_FAILED_AT: &str = "failedAt";
pub const DLQ_RETRY_COUNT: &str = "retryCount";
pub const DLQ_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    EnsuringGroup = 1,
    Polling = 2,
    Processing = 3,
    RetryOrQuarantine = 4,
    Draining = 5,
}

impl From<u8> for ConsumerState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConsumerState::EnsuringGroup,
            2 => ConsumerState::Polling,
            3 => ConsumerState::Processing,
            4 => ConsumerState::RetryOrQuarantine,
            5 => ConsumerState::Draining,
            _ => ConsumerState::Stopped,
        }
    }
}

pub struct StreamConsumer {
    config: ConsumerConfig,
    log: Arc<dyn EventLog>,
    repository: Arc<dyn ReactionRepository>,
    cache: ReactionCache,
    backlog: AtomicBool,
    state: AtomicU8,
    running: AtomicBool,
    last_reclaim: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConsumer {
    pub fn new(
        config: ConsumerConfig,
        log: Arc<dyn EventLog>,
        repository: Arc<dyn ReactionRepository>,
        cache: ReactionCache,
    ) -> Self {
        Self {
            config,
            log,
            repository,
            cache,
            backlog: AtomicBool::new(false),
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            running: AtomicBool::new(false),
            last_reclaim: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> &StreamKeys {
        &self.config.keys
    }

    /// Whether this consumer holds failed entries it must settle before
    /// reading anything new.
    pub fn is_backlogged(&self) -> bool {
        self.backlog.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Record progress inside a cycle. Ignored once stopping so a draining
    /// consumer keeps reporting `Draining`.
    fn enter(&self, state: ConsumerState) {
        if self.is_running() {
            self.set_state(state);
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create the shard's consumer group if it does not exist yet.
    pub async fn ensure_group(&self, start: StartPosition) -> Result<()> {
        let keys = &self.config.keys;
        match self.log.create_group(&keys.stream, &keys.group, start).await {
            Ok(()) => {
                info!(shard = keys.shard, stream = %keys.stream, group = %keys.group, "Created consumer group");
                Ok(())
            }
            Err(LogError::GroupExists { .. }) => {
                debug!(shard = keys.shard, group = %keys.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e)
                .with_context(|| format!("creating group {} on {}", keys.group, keys.stream)),
        }
    }

    /// Ensure the group, reclaim what a previous run left pending and spawn
    /// the poll loop. A no-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(shard = self.config.keys.shard, "Consumer already running");
            return Ok(());
        }

        self.set_state(ConsumerState::EnsuringGroup);
        if let Err(e) = self.ensure_group(StartPosition::Latest).await {
            self.running.store(false, Ordering::SeqCst);
            self.set_state(ConsumerState::Stopped);
            return Err(e);
        }

        if self.reclaim_due() {
            if let Err(e) = self.reclaim_pending().await {
                warn!(shard = self.config.keys.shard, error = %e, "Startup reclaim failed");
            }
        }

        self.enter(ConsumerState::Polling);
        let handle = tokio::spawn(Arc::clone(self).run_loop());
        *self.task() = Some(handle);

        info!(
            shard = self.config.keys.shard,
            stream = %self.config.keys.stream,
            consumer = %self.config.consumer_name,
            "Consumer started"
        );
        Ok(())
    }

    /// Stop polling and wait for the in-flight cycle to finish.
    pub async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let handle = self.task().take();
        if !was_running && handle.is_none() {
            return;
        }

        self.set_state(ConsumerState::Draining);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(shard = self.config.keys.shard, error = %e, "Consumer task ended abnormally");
            }
        }
        self.set_state(ConsumerState::Stopped);
        info!(shard = self.config.keys.shard, "Consumer stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let shard = self.config.keys.shard;
        while self.is_running() {
            let failure = match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(Ok(_)) => {
                    // Space out retries of a failed batch.
                    if self.is_backlogged() && self.is_running() {
                        tokio::time::sleep(self.config.restart_delay).await;
                    }
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };

            error!(shard, error = %failure, "Consumer cycle failed");
            self.enter(ConsumerState::Polling);
            if self.is_running() {
                tokio::time::sleep(self.config.restart_delay).await;
            }
        }
        debug!(shard, "Consumer loop exited");
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    /// One poll iteration: retry this consumer's failed entries, reclaim
    /// idle pending entries if due, then read and process a batch of new
    /// ones. New entries are only read once nothing failed is outstanding.
    /// Returns how many entries were handled.
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut handled = 0;
        if self.is_backlogged() {
            handled += self.retry_backlog().await?;
            if self.is_backlogged() {
                return Ok(handled);
            }
        }
        if self.reclaim_due() {
            handled += self.reclaim_pending().await?;
            if self.is_backlogged() {
                return Ok(handled);
            }
        }

        self.enter(ConsumerState::Polling);
        let keys = &self.config.keys;
        let entries = self
            .log
            .read_new(
                &keys.stream,
                &keys.group,
                &self.config.consumer_name,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await
            .with_context(|| format!("reading {}", keys.stream))?;

        if !entries.is_empty() {
            handled += entries.len();
            self.settle(&entries).await?;
        }
        Ok(handled)
    }

    /// Redeliver this consumer's own pending entries, oldest first.
    async fn retry_backlog(&self) -> Result<usize> {
        let keys = &self.config.keys;
        let entries = self
            .log
            .read_pending(
                &keys.stream,
                &keys.group,
                &self.config.consumer_name,
                self.config.batch_size,
            )
            .await
            .with_context(|| format!("reading own pending entries on {}", keys.stream))?;
        if entries.is_empty() {
            self.backlog.store(false, Ordering::SeqCst);
            return Ok(0);
        }

        debug!(shard = keys.shard, count = entries.len(), "Retrying failed entries");
        let left = self.process_batch(&entries).await?;
        let full_page = entries.len() >= self.config.batch_size;
        self.backlog.store(left > 0 || full_page, Ordering::SeqCst);
        Ok(entries.len())
    }

    /// Process a batch, staying in backlog unless every entry was settled.
    /// An error part way through leaves the backlog set, so whatever is
    /// still pending is retried before anything newer is read.
    async fn settle(&self, entries: &[RawEntry]) -> Result<()> {
        self.backlog.store(true, Ordering::SeqCst);
        let left = self.process_batch(entries).await?;
        self.backlog.store(left > 0, Ordering::SeqCst);
        Ok(())
    }

    fn reclaim_due(&self) -> bool {
        let mut last = self
            .last_reclaim
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.config.reclaim_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Claim entries left pending longer than `reclaim_min_idle` and process
    /// them as fresh batches. Keeps going while full pages come back and
    /// stops at the first batch that fails.
    pub async fn reclaim_pending(&self) -> Result<usize> {
        let keys = &self.config.keys;
        let mut reclaimed = 0;
        loop {
            let entries = self
                .log
                .claim_idle(
                    &keys.stream,
                    &keys.group,
                    &self.config.consumer_name,
                    self.config.reclaim_min_idle,
                    self.config.batch_size,
                )
                .await
                .with_context(|| format!("claiming idle entries on {}", keys.stream))?;
            if entries.is_empty() {
                break;
            }

            let full_page = entries.len() >= self.config.batch_size;
            reclaimed += entries.len();
            info!(shard = keys.shard, count = entries.len(), "Reclaimed idle pending entries");
            self.settle(&entries).await?;
            if !full_page || self.is_backlogged() {
                break;
            }
        }
        Ok(reclaimed)
    }

    /// Normalize, reduce, apply and settle one batch. Returns how many
    /// entries were left pending for another attempt.
    pub async fn process_batch(&self, entries: &[RawEntry]) -> Result<usize> {
        self.enter(ConsumerState::Processing);
        let shard = self.config.keys.shard;

        let mut events = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();
        for entry in entries {
            match ReactionEvent::from_entry(entry) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    warn!(shard, entry_id = entry.id, reason = %reason, "Dropping malformed reaction entry");
                    malformed.push(entry.id);
                }
            }
        }
        if !malformed.is_empty() {
            self.acknowledge(&malformed).await?;
        }
        if events.is_empty() {
            self.enter(ConsumerState::Polling);
            return Ok(0);
        }

        let notes = reduce(&events);
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let left = match self.apply(&notes).await {
            Ok(outcome) => {
                self.acknowledge(&ids).await?;
                info!(
                    shard,
                    count = ids.len(),
                    notes = outcome.note_totals.len(),
                    "Applied reaction batch"
                );
                0
            }
            Err(e) => {
                warn!(shard, count = ids.len(), error = %e, "Reaction batch failed");
                self.enter(ConsumerState::RetryOrQuarantine);
                self.retry_or_quarantine(entries, &events, &e.to_string())
                    .await?
            }
        };

        self.enter(ConsumerState::Polling);
        Ok(left)
    }

    /// Commit to storage, then publish the new totals.
    async fn apply(&self, notes: &NotesMap) -> notereact_common::Result<BulkApplyOutcome> {
        let outcome = self.repository.bulk_apply(notes).await?;
        self.cache.bulk_set_counts(&outcome.note_totals).await?;
        Ok(outcome)
    }

    /// Leave entries with attempts to spare pending and dead-letter the
    /// rest. Returns how many were left pending.
    async fn retry_or_quarantine(
        &self,
        entries: &[RawEntry],
        events: &[ReactionEvent],
        error: &str,
    ) -> Result<usize> {
        let keys = &self.config.keys;
        let by_id: HashMap<i64, &RawEntry> = entries.iter().map(|e| (e.id, e)).collect();
        let failed_at = chrono::Utc::now().to_rfc3339();
        let mut left = 0;

        for event in events {
            let attempts = event.attempts();
            if attempts <= self.config.max_retries {
                debug!(shard = keys.shard, entry_id = event.id, attempts, "Entry left pending for retry");
                left += 1;
                continue;
            }
            let Some(entry) = by_id.get(&event.id) else {
                continue;
            };

            let mut fields = entry.fields.clone();
            fields.insert(DLQ_ORIGINAL_ID.to_string(), event.id.to_string());
            fields.insert(DLQ_FAILED_AT.to_string(), failed_at.clone());
            fields.insert(DLQ_RETRY_COUNT.to_string(), attempts.to_string());
            fields.insert(DLQ_ERROR.to_string(), error.to_string());

            let dead_letter_id = self
                .log
                .append(&keys.dead_letter, &fields)
                .await
                .with_context(|| format!("appending to {}", keys.dead_letter))?;
            self.acknowledge(&[event.id]).await?;

            error!(
                shard = keys.shard,
                entry_id = event.id,
                dead_letter_id,
                attempts,
                error,
                "Quarantined reaction entry"
            );
        }
        Ok(left)
    }

    async fn acknowledge(&self, ids: &[i64]) -> Result<()> {
        let keys = &self.config.keys;
        self.log
            .ack(&keys.stream, &keys.group, ids)
            .await
            .with_context(|| format!("acking {} entries on {}", ids.len(), keys.stream))?;
        if self.config.purge_acked {
            self.log
                .delete(&keys.stream, ids)
                .await
                .with_context(|| format!("purging {} entries from {}", ids.len(), keys.stream))?;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConsumerState::Stopped,
            ConsumerState::EnsuringGroup,
            ConsumerState::Polling,
            ConsumerState::Processing,
            ConsumerState::RetryOrQuarantine,
            ConsumerState::Draining,
        ] {
            assert_eq!(ConsumerState::from(state as u8), state);
        }
        assert_eq!(ConsumerState::from(200), ConsumerState::Stopped);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panic: bang");
        let payload: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
