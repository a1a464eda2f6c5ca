//! Bulk reaction repository.
//!
//! Applies one batch of resolved (note, user) → reaction changes in a single
//! transaction: diff against stored reactions, write the rows that changed,
//! fold the signed per-kind deltas into each note's counters and report the
//! resulting totals.

pub mod memory;
pub mod plan;
pub mod postgres;
pub mod repository;

pub use memory::MemoryReactionRepository;
pub use plan::{BatchPlan, ReactionKey, ValidatedBatch};
pub use postgres::PgReactionRepository;
pub use repository::ReactionRepository;
