//! The repository seam the consumer and cache are written against.

use std::sync::Arc;

use async_trait::async_trait;
use notereact_common::{BulkApplyOutcome, NoteCounts, NotesMap, ReactionKind, Result};

/// Applies resolved reaction batches and serves point reads.
///
/// Implemented by `PgReactionRepository` (postgres) and
/// `MemoryReactionRepository` (tests). Also implemented for `Arc<R>` so a
/// repository can be shared for assertions.
#[async_trait]
pub trait ReactionRepository: Send + Sync {
    /// Apply one batch atomically. Every identifier is validated before
    /// anything is read or written; a single bad one fails the whole call.
    async fn bulk_apply(&self, notes: &NotesMap) -> Result<BulkApplyOutcome>;

    /// A note's counters, or `None` when it has none yet.
    async fn note_counts(&self, note_id: &str) -> Result<Option<NoteCounts>>;

    /// One user's current reaction on one note.
    async fn user_reaction(&self, note_id: &str, user_id: &str) -> Result<Option<ReactionKind>>;
}

#[async_trait]
impl<R: ReactionRepository + ?Sized> ReactionRepository for Arc<R> {
    async fn bulk_apply(&self, notes: &NotesMap) -> Result<BulkApplyOutcome> {
        (**self).bulk_apply(notes).await
    }

    async fn note_counts(&self, note_id: &str) -> Result<Option<NoteCounts>> {
        (**self).note_counts(note_id).await
    }

    async fn user_reaction(&self, note_id: &str, user_id: &str) -> Result<Option<ReactionKind>> {
        (**self).user_reaction(note_id, user_id).await
    }
}
