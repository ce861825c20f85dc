//! Job and result store for the audio pipeline.
//!
//! This crate provides:
//! - The `JobStore` contract: idempotent insert, compare-and-set, results
//! - In-memory and Redis implementations
//! - Event sinks for job state changes (broadcast, Redis pub/sub)

pub mod error;
pub mod events;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use events::{BroadcastEvents, EventSink, NoopEvents, RedisEvents};
pub use memory::MemoryJobStore;
pub use redis_store::RedisJobStore;
pub use store::{InsertOutcome, JobStore};
