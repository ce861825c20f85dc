#![deny(unreachable_patterns)]
//! Audio processing engine for the job pipeline.
//!
//! This crate provides:
//! - The `AudioEngine` contract workers invoke
//! - An FFmpeg-backed engine (command building, probing, loudnorm analysis)
//! - A content-addressed result cache decorator

pub mod cache;
pub mod command;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod probe;

pub use cache::{CacheKey, CachedEngine, CACHE_HITS_METRIC, DEFAULT_CACHE_MAX_BYTES};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use engine::{AudioEngine, AudioInput, EngineOutput};
pub use error::{EngineError, EngineResult};
pub use ffmpeg::{FfmpegEngine, ENGINE_REVISION};
pub use probe::{probe_audio, AudioInfo};
