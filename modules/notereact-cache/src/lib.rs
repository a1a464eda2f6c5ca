//! Read-through TTL cache of per-note reaction counters.
//!
//! The cache store is partitioned. Keys carry a `{hash tag}` so every key of
//! one note lands on the same partition; multi-key writes are split per
//! partition, run concurrently and recombined in input order.
//!
//! `PgCacheStore` is the shared production store; `MemoryCacheStore` is the
//! in-process double used by tests.

pub mod counts;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod store;

pub use counts::{counts_key, ReactionCache};
pub use memory::MemoryCacheStore;
pub use pipeline::PartitionedPipeline;
pub use postgres::PgCacheStore;
pub use store::{hash_tag, partition_for, CacheOp, CacheReply, CacheStore};
