//! In-memory repository for tests. Runs the same plan as the postgres
//! repository under one lock, and can be told to fail on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use notereact_common::{
    parse_id, BulkApplyOutcome, NoteCounts, NotesMap, ReactionError, ReactionKind, Result,
};
use uuid::Uuid;

use crate::plan::{BatchPlan, ReactionKey, ValidatedBatch};
use crate::repository::ReactionRepository;

#[derive(Default)]
struct MemoryState {
    reactions: HashMap<ReactionKey, ReactionKind>,
    counters: HashMap<Uuid, NoteCounts>,
}

/// In-memory reaction repository. Thread-safe.
#[derive(Default)]
pub struct MemoryReactionRepository {
    state: Mutex<MemoryState>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    apply_calls: AtomicUsize,
    row_writes: AtomicUsize,
}

impl MemoryReactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` calls to `bulk_apply` as if the transaction aborted.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every `bulk_apply` until switched off.
    pub fn fail_always(&self, enabled: bool) {
        self.fail_always.store(enabled, Ordering::SeqCst);
    }

    /// Number of `bulk_apply` calls, failed ones included.
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Number of reaction rows upserted or deleted so far.
    pub fn row_writes(&self) -> usize {
        self.row_writes.load(Ordering::SeqCst)
    }

    /// Seed a stored reaction and its counter, bypassing the batch path.
    pub fn seed(&self, note_id: &str, user_id: &str, kind: ReactionKind) -> Result<()> {
        let key = ReactionKey {
            note_id: parse_id("noteId", note_id)?,
            user_id: parse_id("userId", user_id)?,
        };
        let mut state = self.state();
        if let Some(old) = state.reactions.insert(key, kind) {
            state.counters.entry(key.note_id).or_default().add(old, -1);
        }
        state.counters.entry(key.note_id).or_default().add(kind, 1);
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReactionRepository for MemoryReactionRepository {
    async fn bulk_apply(&self, notes: &NotesMap) -> Result<BulkApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let batch = ValidatedBatch::parse(notes)?;
        if self.take_injected_failure() {
            return Err(ReactionError::Other(anyhow::anyhow!(
                "injected transaction failure"
            )));
        }

        let mut state = self.state();

        let existing: HashMap<ReactionKey, ReactionKind> = batch
            .keys()
            .into_iter()
            .filter_map(|k| state.reactions.get(&k).map(|kind| (k, *kind)))
            .collect();

        let plan = BatchPlan::build(&batch, &existing);

        for (key, kind) in &plan.upserts {
            state.reactions.insert(*key, *kind);
        }
        for key in &plan.deletes {
            state.reactions.remove(key);
        }
        self.row_writes
            .fetch_add(plan.upserts.len() + plan.deletes.len(), Ordering::SeqCst);

        for (note_id, delta) in plan.nonzero_deltas() {
            state.counters.entry(*note_id).or_default().merge(delta);
        }

        let mut outcome = BulkApplyOutcome::default();
        for (note_id, delta) in &plan.deltas {
            let Some(raw) = batch.raw_note_id(note_id) else {
                continue;
            };
            if let Some(total) = state.counters.get(note_id).filter(|t| !t.is_empty()) {
                outcome.note_totals.insert(raw.to_string(), total.clone());
            }
            outcome.note_deltas.insert(raw.to_string(), delta.clone());
        }
        Ok(outcome)
    }

    async fn note_counts(&self, note_id: &str) -> Result<Option<NoteCounts>> {
        let id = parse_id("noteId", note_id)?;
        Ok(self
            .state()
            .counters
            .get(&id)
            .filter(|counts| !counts.is_empty())
            .cloned())
    }

    async fn user_reaction(&self, note_id: &str, user_id: &str) -> Result<Option<ReactionKind>> {
        let key = ReactionKey {
            note_id: parse_id("noteId", note_id)?,
            user_id: parse_id("userId", user_id)?,
        };
        Ok(self.state().reactions.get(&key).copied())
    }
}
