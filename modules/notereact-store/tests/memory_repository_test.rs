//! Bulk apply behavior against the in-memory repository. No database required.

use std::collections::BTreeMap;

use notereact_common::{NoteCounts, NotesMap, ReactionChange, ReactionKind};
use notereact_store::{MemoryReactionRepository, ReactionRepository};
use uuid::Uuid;

fn id() -> String {
    Uuid::new_v4().to_string()
}

fn notes(entries: &[(&str, &str, ReactionChange)]) -> NotesMap {
    let mut map: NotesMap = BTreeMap::new();
    for (note, user, change) in entries {
        map.entry(note.to_string())
            .or_default()
            .insert(user.to_string(), *change);
    }
    map
}

use ReactionChange::{Removed, Set};
use ReactionKind::{Like, Love};

// =========================================================================
// Worked scenarios
// =========================================================================

#[tokio::test]
async fn two_users_on_a_fresh_note() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1, u2) = (id(), id(), id());

    let outcome = repo
        .bulk_apply(&notes(&[
            (n1.as_str(), u1.as_str(), Set(Like)),
            (n1.as_str(), u2.as_str(), Set(Love)),
        ]))
        .await
        .unwrap();

    let expected = NoteCounts::new().with(Like, 1).with(Love, 1);
    assert_eq!(outcome.note_deltas[&n1], expected);
    assert_eq!(outcome.note_totals[&n1], expected);
}

#[tokio::test]
async fn removal_reports_negative_delta_and_deletes_row() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1) = (id(), id());
    repo.seed(&n1, &u1, Like).unwrap();

    let outcome = repo
        .bulk_apply(&notes(&[(n1.as_str(), u1.as_str(), Removed)]))
        .await
        .unwrap();

    assert_eq!(outcome.note_deltas[&n1].get(Like), -1);
    assert_eq!(outcome.note_deltas[&n1].get(Love), 0);
    assert_eq!(repo.user_reaction(&n1, &u1).await.unwrap(), None);
    assert_eq!(outcome.note_totals[&n1], NoteCounts::zeroed());
}

#[tokio::test]
async fn note_without_counters_gets_no_totals() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1) = (id(), id());

    let outcome = repo
        .bulk_apply(&notes(&[(n1.as_str(), u1.as_str(), Removed)]))
        .await
        .unwrap();

    assert!(outcome.note_deltas[&n1].is_zero());
    assert!(!outcome.note_totals.contains_key(&n1));
    assert_eq!(repo.note_counts(&n1).await.unwrap(), None);
}

// =========================================================================
// Properties
// =========================================================================

#[tokio::test]
async fn reapplying_stored_kind_is_a_no_op() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1) = (id(), id());
    repo.seed(&n1, &u1, Love).unwrap();

    let outcome = repo
        .bulk_apply(&notes(&[(n1.as_str(), u1.as_str(), Set(Love))]))
        .await
        .unwrap();

    assert!(outcome.note_deltas[&n1].is_zero());
    assert_eq!(repo.row_writes(), 0);
    assert_eq!(outcome.note_totals[&n1], NoteCounts::new().with(Love, 1));
}

#[tokio::test]
async fn delta_sum_matches_final_counters() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1, u2, u3) = (id(), id(), id(), id());

    let batches = [
        notes(&[
            (n1.as_str(), u1.as_str(), Set(Like)),
            (n1.as_str(), u2.as_str(), Set(Like)),
        ]),
        notes(&[
            (n1.as_str(), u1.as_str(), Set(Love)),
            (n1.as_str(), u3.as_str(), Set(ReactionKind::Sad)),
        ]),
        notes(&[
            (n1.as_str(), u2.as_str(), Removed),
            (n1.as_str(), u3.as_str(), Set(ReactionKind::Sad)),
        ]),
        notes(&[(n1.as_str(), u2.as_str(), Removed)]),
    ];

    let mut summed = NoteCounts::new();
    for batch in &batches {
        let outcome = repo.bulk_apply(batch).await.unwrap();
        summed.merge(&outcome.note_deltas[&n1]);
    }

    let stored = repo.note_counts(&n1).await.unwrap().unwrap();
    assert_eq!(summed, stored);
    assert_eq!(
        stored,
        NoteCounts::new().with(Love, 1).with(ReactionKind::Sad, 1)
    );
}

#[tokio::test]
async fn invalid_identifier_fails_before_any_write() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1) = (id(), id());

    let mut batch = notes(&[(n1.as_str(), u1.as_str(), Set(Like))]);
    batch
        .entry("N2".to_string())
        .or_default()
        .insert(id(), Set(Love));

    let err = repo.bulk_apply(&batch).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(repo.user_reaction(&n1, &u1).await.unwrap(), None);
    assert_eq!(repo.note_counts(&n1).await.unwrap(), None);
}

#[tokio::test]
async fn injected_failure_leaves_state_untouched() {
    let repo = MemoryReactionRepository::new();
    let (n1, u1) = (id(), id());
    repo.fail_next(1);

    let batch = notes(&[(n1.as_str(), u1.as_str(), Set(Like))]);
    assert!(repo.bulk_apply(&batch).await.is_err());
    assert_eq!(repo.note_counts(&n1).await.unwrap(), None);

    let outcome = repo.bulk_apply(&batch).await.unwrap();
    assert_eq!(outcome.note_totals[&n1].get(Like), 1);
    assert_eq!(repo.apply_calls(), 2);
}

#[tokio::test]
async fn note_without_counters_reads_as_none() {
    let repo = MemoryReactionRepository::new();
    assert_eq!(repo.note_counts(&id()).await.unwrap(), None);
    assert!(repo.note_counts("not-a-note").await.is_err());
}
