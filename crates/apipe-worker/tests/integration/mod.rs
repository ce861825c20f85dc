//! End-to-end tests for the dispatcher and worker pool.
//!
//! Pipeline tests run against the in-memory broker and store with a fake
//! engine. Redis, S3 and FFmpeg tests are ignored by default.

pub mod support;

pub mod ffmpeg_tests;
pub mod pipeline_tests;
pub mod pool_tests;
pub mod redis_tests;
pub mod storage_tests;
