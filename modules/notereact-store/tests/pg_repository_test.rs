//! Integration tests for PgReactionRepository.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::BTreeMap;

use notereact_common::{NoteCounts, NotesMap, ReactionChange, ReactionKind};
use notereact_store::{PgReactionRepository, ReactionRepository};
use sqlx::PgPool;
use uuid::Uuid;

/// Get a migrated repository, or skip if no test DB is available.
async fn test_repo() -> Option<(PgReactionRepository, PgPool)> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let repo = PgReactionRepository::new(pool.clone());
    repo.migrate().await.ok()?;
    Some((repo, pool))
}

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

#[tokio::test]
async fn bulk_apply_round_trip() {
    let Some((repo, _pool)) = test_repo().await else {
        return;
    };
    let (n1, u1, u2) = (id(), id(), id());

    let first = repo
        .bulk_apply(&notes(&[
            (n1.as_str(), u1.as_str(), Set(Like)),
            (n1.as_str(), u2.as_str(), Set(Love)),
        ]))
        .await
        .unwrap();
    assert_eq!(
        first.note_totals[&n1],
        NoteCounts::new().with(Like, 1).with(Love, 1)
    );

    let second = repo
        .bulk_apply(&notes(&[
            (n1.as_str(), u1.as_str(), Removed),
            (n1.as_str(), u2.as_str(), Set(Love)),
        ]))
        .await
        .unwrap();
    assert_eq!(second.note_deltas[&n1].get(Like), -1);
    assert_eq!(second.note_deltas[&n1].get(Love), 0);
    assert_eq!(second.note_totals[&n1], NoteCounts::new().with(Love, 1));

    assert_eq!(repo.user_reaction(&n1, &u1).await.unwrap(), None);
    assert_eq!(repo.user_reaction(&n1, &u2).await.unwrap(), Some(Love));
    assert_eq!(
        repo.note_counts(&n1).await.unwrap(),
        Some(NoteCounts::new().with(Love, 1))
    );
}

#[tokio::test]
async fn validation_failure_writes_nothing() {
    let Some((repo, pool)) = test_repo().await else {
        return;
    };
    let (n1, u1) = (id(), id());

    let mut batch = notes(&[(n1.as_str(), u1.as_str(), Set(Like))]);
    batch
        .entry(n1.clone())
        .or_default()
        .insert("bogus".to_string(), Set(Love));

    assert!(repo.bulk_apply(&batch).await.unwrap_err().is_validation());

    let (rows,) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM note_reactions WHERE note_id = $1",
    )
    .bind(Uuid::parse_str(&n1).unwrap())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn concurrent_batches_on_one_note_do_not_lose_increments() {
    let Some((repo, _pool)) = test_repo().await else {
        return;
    };
    let n1 = id();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        let n1 = n1.clone();
        handles.push(tokio::spawn(async move {
            let u = id();
            repo.bulk_apply(&notes(&[(n1.as_str(), u.as_str(), Set(Like))]))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let counts = repo.note_counts(&n1).await.unwrap().unwrap();
    assert_eq!(counts.get(Like), 8);
}

#[tokio::test]
async fn note_without_counters_gets_no_totals() {
    let Some((repo, _pool)) = test_repo().await else {
        return;
    };
    let (n1, u1) = (id(), id());

    let outcome = repo
        .bulk_apply(&notes(&[(n1.as_str(), u1.as_str(), Removed)]))
        .await
        .unwrap();

    assert!(outcome.note_deltas[&n1].is_zero());
    assert!(!outcome.note_totals.contains_key(&n1));
    assert_eq!(repo.note_counts(&n1).await.unwrap(), None);
}

#[tokio::test]
async fn unknown_stored_counter_keys_do_not_fail_batches() {
    let Some((repo, pool)) = test_repo().await else {
        return;
    };
    let (n1, u1) = (id(), id());
    sqlx::query(
        r#"INSERT INTO notes (id, reaction_counts) VALUES ($1, '{"like": 2, "thumbs": 5, "wow": "many"}'::jsonb)"#,
    )
    .bind(Uuid::parse_str(&n1).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let outcome = repo
        .bulk_apply(&notes(&[(n1.as_str(), u1.as_str(), Set(Love))]))
        .await
        .unwrap();

    assert_eq!(
        outcome.note_totals[&n1],
        NoteCounts::new().with(Like, 2).with(Love, 1)
    );
    assert_eq!(
        repo.note_counts(&n1).await.unwrap(),
        Some(NoteCounts::new().with(Like, 2).with(Love, 1))
    );
}
