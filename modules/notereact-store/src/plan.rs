//! Pure diffing of requested changes against stored reactions. No I/O; both
//! repository implementations run the same plan.

use std::collections::{BTreeMap, HashMap};

use notereact_common::{parse_id, NoteCounts, NotesMap, ReactionChange, ReactionKind, Result};
use uuid::Uuid;

/// Identity of one stored reaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactionKey {
    pub note_id: Uuid,
    pub user_id: Uuid,
}

/// A batch whose every identifier parsed. Building one is all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    changes: Vec<(ReactionKey, ReactionChange)>,
    notes: BTreeMap<Uuid, String>,
}

impl ValidatedBatch {
    pub fn parse(notes_map: &NotesMap) -> Result<Self> {
        let mut batch = ValidatedBatch::default();
        for (raw_note, users) in notes_map {
            let note_id = parse_id("noteId", raw_note)?;
            batch.notes.insert(note_id, raw_note.clone());
            for (raw_user, change) in users {
                let user_id = parse_id("userId", raw_user)?;
                batch.changes.push((ReactionKey { note_id, user_id }, *change));
            }
        }
        Ok(batch)
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn changes(&self) -> &[(ReactionKey, ReactionChange)] {
        &self.changes
    }

    pub fn keys(&self) -> Vec<ReactionKey> {
        self.changes.iter().map(|(key, _)| *key).collect()
    }

    pub fn note_ids(&self) -> Vec<Uuid> {
        self.notes.keys().copied().collect()
    }

    /// The identifier exactly as the caller spelled it.
    pub fn raw_note_id(&self, note_id: &Uuid) -> Option<&str> {
        self.notes.get(note_id).map(String::as_str)
    }
}

/// Writes and counter deltas for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub upserts: Vec<(ReactionKey, ReactionKind)>,
    pub deletes: Vec<ReactionKey>,
    /// Every note of the batch, zero-filled for every kind.
    pub deltas: BTreeMap<Uuid, NoteCounts>,
}

impl BatchPlan {
    pub fn build(batch: &ValidatedBatch, existing: &HashMap<ReactionKey, ReactionKind>) -> Self {
        let mut plan = BatchPlan {
            deltas: batch
                .note_ids()
                .into_iter()
                .map(|id| (id, NoteCounts::zeroed()))
                .collect(),
            ..Default::default()
        };

        for (key, change) in batch.changes() {
            let prior = existing.get(key).copied();
            let delta = plan.deltas.entry(key.note_id).or_insert_with(NoteCounts::zeroed);

            match (*change, prior) {
                (ReactionChange::Removed, None) => {}
                (ReactionChange::Removed, Some(old)) => {
                    plan.deletes.push(*key);
                    delta.add(old, -1);
                }
                (ReactionChange::Set(new), Some(old)) if new == old => {}
                (ReactionChange::Set(new), prior) => {
                    plan.upserts.push((*key, new));
                    if let Some(old) = prior {
                        delta.add(old, -1);
                    }
                    delta.add(new, 1);
                }
            }
        }

        plan
    }

    pub fn has_writes(&self) -> bool {
        !self.upserts.is_empty() || !self.deletes.is_empty()
    }

    /// Deltas that actually move a counter.
    pub fn nonzero_deltas(&self) -> impl Iterator<Item = (&Uuid, &NoteCounts)> {
        self.deltas.iter().filter(|(_, d)| !d.is_zero())
    }
}
