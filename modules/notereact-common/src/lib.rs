//! Shared vocabulary for the reaction pipeline: reaction kinds, per-note
//! counters, the batch map handed from consumer to repository, the error
//! type and environment configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::PipelineConfig;
pub use error::{ReactionError, Result};
pub use types::*;
