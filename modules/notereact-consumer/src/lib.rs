//! Per-shard stream consumer for reaction events.

pub mod config;
pub mod consumer;
pub mod event;
pub mod reduce;

pub use config::ConsumerConfig;
pub use consumer::{ConsumerState, StreamConsumer};
pub use event::{Malformed, ReactionEvent};
pub use reduce::reduce;
