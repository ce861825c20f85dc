//! Integration test runner.
//!
//! Run all integration tests:
//!   cargo test -p apipe-worker --test integration
//!
//! Run tests that require external services (Redis, S3, FFmpeg):
//!   cargo test -p apipe-worker --test integration -- --ignored

#[path = "integration/mod.rs"]
mod integration;
