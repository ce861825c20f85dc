//! Job broker for the audio pipeline.
//!
//! This crate provides:
//! - The `QueueBroker` contract: prioritized, leased, at-least-once delivery
//! - An in-process broker (single node, tests)
//! - A Redis broker with Lua-scripted leases and visibility timeouts

pub mod broker;
pub mod config;
pub mod error;
pub mod memory;
pub mod redis_broker;

pub use broker::{Lease, LeaseToken, QueueBroker, QueueDepth, TierDepth};
pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
