//! ReactionCache and PartitionedPipeline over the in-memory cache store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use notereact_cache::{
    counts_key, partition_for, CacheOp, CacheReply, CacheStore, MemoryCacheStore,
    PartitionedPipeline, ReactionCache,
};
use notereact_common::{NoteCounts, ReactionKind};
use notereact_store::MemoryReactionRepository;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(60);

fn id() -> String {
    Uuid::new_v4().to_string()
}

fn setup() -> (Arc<MemoryCacheStore>, Arc<MemoryReactionRepository>, ReactionCache) {
    let store = Arc::new(MemoryCacheStore::new(8));
    let repo = Arc::new(MemoryReactionRepository::new());
    let cache = ReactionCache::new(store.clone(), repo.clone(), TTL);
    (store, repo, cache)
}

// =========================================================================
// Read-through
// =========================================================================

#[tokio::test]
async fn miss_is_repaired_from_repository() {
    let (store, repo, cache) = setup();
    let note = id();
    repo.seed(&note, &id(), ReactionKind::Like).unwrap();
    repo.seed(&note, &id(), ReactionKind::Like).unwrap();

    assert!(!cache.has_cache(&note).await.unwrap());

    let counts = cache.get_counts(&note).await.unwrap().unwrap();
    assert_eq!(counts, NoteCounts::new().with(ReactionKind::Like, 2));
    assert!(cache.has_cache(&note).await.unwrap());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn unknown_note_stays_uncached() {
    let (store, _repo, cache) = setup();
    let note = id();

    assert_eq!(cache.get_counts(&note).await.unwrap(), None);
    assert!(!cache.has_cache(&note).await.unwrap());
    assert!(store.is_empty());
}

#[tokio::test]
async fn hit_is_served_from_cache() {
    let (_store, repo, cache) = setup();
    let note = id();
    let cached = NoteCounts::new().with(ReactionKind::Wow, 7);
    cache.set_counts(&note, &cached).await.unwrap();

    // Stored counts now differ from the cached ones.
    repo.seed(&note, &id(), ReactionKind::Sad).unwrap();

    assert_eq!(cache.get_counts(&note).await.unwrap(), Some(cached));
}

#[tokio::test]
async fn set_counts_replaces_previous_fields() {
    let (_store, _repo, cache) = setup();
    let note = id();
    cache
        .set_counts(&note, &NoteCounts::new().with(ReactionKind::Love, 3))
        .await
        .unwrap();
    cache
        .set_counts(&note, &NoteCounts::new().with(ReactionKind::Haha, 1))
        .await
        .unwrap();

    let counts = cache.get_counts(&note).await.unwrap().unwrap();
    assert_eq!(counts.get(ReactionKind::Love), 0);
    assert_eq!(counts.get(ReactionKind::Haha), 1);
}

// =========================================================================
// TTL
// =========================================================================

#[tokio::test(start_paused = true)]
async fn reads_refresh_ttl_and_cold_keys_expire() {
    let (_store, _repo, cache) = setup();
    let note = id();
    cache
        .set_counts(&note, &NoteCounts::new().with(ReactionKind::Like, 1))
        .await
        .unwrap();
    assert_eq!(cache.remaining_ttl(&note).await.unwrap(), Some(TTL));

    tokio::time::advance(Duration::from_secs(40)).await;
    assert_eq!(
        cache.remaining_ttl(&note).await.unwrap(),
        Some(Duration::from_secs(20))
    );

    assert!(cache.has_cache(&note).await.unwrap());
    assert_eq!(cache.remaining_ttl(&note).await.unwrap(), Some(TTL));

    tokio::time::advance(TTL).await;
    assert!(!cache.has_cache(&note).await.unwrap());
    assert_eq!(cache.remaining_ttl(&note).await.unwrap(), None);
}

// =========================================================================
// Bulk writes
// =========================================================================

#[tokio::test]
async fn bulk_set_spans_partitions() {
    let (store, _repo, cache) = setup();
    let mut totals = BTreeMap::new();
    for n in 0..32 {
        totals.insert(id(), NoteCounts::zeroed().with(ReactionKind::Like, n));
    }
    let partitions: std::collections::HashSet<usize> = totals
        .keys()
        .map(|note| partition_for(&counts_key(note), store.partition_count()))
        .collect();
    assert!(partitions.len() > 1);

    cache.bulk_set_counts(&totals).await.unwrap();

    assert_eq!(store.len(), totals.len());
    for (note, expected) in &totals {
        assert_eq!(cache.get_counts(note).await.unwrap().as_ref(), Some(expected));
    }
}

#[tokio::test]
async fn bulk_set_failure_propagates() {
    let (store, _repo, cache) = setup();
    let mut totals = BTreeMap::new();
    totals.insert(id(), NoteCounts::zeroed());
    store.fail_next(1);

    let err = cache.bulk_set_counts(&totals).await.unwrap_err();
    assert!(!err.is_validation());
}

#[tokio::test]
async fn empty_bulk_set_is_a_no_op() {
    let (store, _repo, cache) = setup();
    store.fail_next(1);
    cache.bulk_set_counts(&BTreeMap::new()).await.unwrap();
}

// =========================================================================
// PartitionedPipeline
// =========================================================================

#[tokio::test]
async fn pipeline_replies_follow_push_order() {
    let store = MemoryCacheStore::new(4);
    let keys: Vec<String> = (0..12).map(|_| counts_key(&id())).collect();

    let mut pipeline = PartitionedPipeline::new(&store);
    for (n, key) in keys.iter().enumerate() {
        let mut fields = HashMap::new();
        fields.insert("n".to_string(), n.to_string());
        pipeline.push(CacheOp::HSet {
            key: key.clone(),
            fields,
        });
    }
    for key in &keys {
        pipeline.push(CacheOp::HGetAll { key: key.clone() });
    }
    assert_eq!(pipeline.len(), 24);

    let replies = pipeline.execute().await.unwrap();
    assert_eq!(replies.len(), 24);
    assert!(replies[..12].iter().all(|r| *r == CacheReply::Done));
    for (n, reply) in replies[12..].iter().enumerate() {
        let CacheReply::Hash(Some(fields)) = reply else {
            panic!("expected hash reply, got {reply:?}");
        };
        assert_eq!(fields["n"], n.to_string());
    }
}

#[tokio::test]
async fn store_rejects_keys_from_another_partition() {
    let store = MemoryCacheStore::new(4);
    let key = counts_key(&id());
    let wrong = (store.partition_of(&key) + 1) % 4;

    let result = store.execute(wrong, vec![CacheOp::Exists { key }]).await;
    assert!(result.is_err());
}
