//! Partitioned, append-only reaction log with consumer-group delivery.
//!
//! Each shard is its own stream. A consumer group tracks a delivery cursor
//! per stream plus a pending-entries list: entries handed to a member stay
//! pending until acknowledged, and entries left idle too long can be claimed
//! by another member. Nothing here knows what a reaction is.

pub mod error;
pub mod log;
pub mod memory;
pub mod postgres;
pub mod types;

pub use error::{LogError, Result};
pub use log::EventLog;
pub use memory::MemoryEventLog;
pub use postgres::PgEventLog;
pub use types::{RawEntry, StartPosition, StreamKeys};
