//! FFmpeg engine against real audio.

use std::process::Stdio;

use apipe_engine::{AudioEngine, AudioInput, FfmpegEngine};
use apipe_models::{Feature, OperationSpec, PayloadRef};
use tokio::process::Command;

/// 1.2 s of a 440 Hz sine at 48 kHz, as WAV bytes.
async fn sine_wav() -> Vec<u8> {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("sine.wav");

    let status = Command::new("ffmpeg")
        .args(["-y", "-hide_banner", "-loglevel", "error"])
        .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=1.2"])
        .args(["-ar", "48000", "-ac", "1"])
        .arg(&path)
        .stdin(Stdio::null())
        .status()
        .await
        .expect("Failed to run ffmpeg");
    assert!(status.success(), "ffmpeg could not generate test audio");

    tokio::fs::read(&path).await.expect("Failed to read generated audio")
}

fn assert_duration_near(ms: Option<i64>, expected: i64) {
    let ms = ms.expect("durationMs missing");
    assert!((ms - expected).abs() <= 50, "duration {} ms, expected ~{}", ms, expected);
}

/// Normalize a generated tone and check the reported metrics.
#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_normalize_sine() {
    let engine = FfmpegEngine::detect().await.expect("FFmpeg not available");
    let input = AudioInput::new(PayloadRef::new("uploads/sine.wav"), sine_wav().await);

    let output = engine
        .process(&input, &OperationSpec::normalize())
        .await
        .expect("Normalize failed");

    let audio = output.audio.as_ref().expect("normalize produces audio");
    assert!(audio.starts_with(b"RIFF"));
    assert_eq!(output.extension(), Some("wav"));

    assert_duration_near(output.metrics.get("durationMs").and_then(|m| m.as_i64()), 1200);
    assert_eq!(output.metrics.get("sampleRate").and_then(|m| m.as_i64()), Some(48_000));

    println!("Normalize metrics: {:?}", output.metrics);
}

/// Measure a generated tone without producing audio.
#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_extract_features_sine() {
    let engine = FfmpegEngine::detect().await.expect("FFmpeg not available");
    let input = AudioInput::new(PayloadRef::new("uploads/sine.wav"), sine_wav().await);

    let op = OperationSpec::ExtractFeatures {
        features: vec![Feature::Duration, Feature::SampleRate, Feature::Loudness],
    };
    let output = engine.process(&input, &op).await.expect("Extraction failed");

    assert!(output.audio.is_none());
    assert_duration_near(output.metrics.get("durationMs").and_then(|m| m.as_i64()), 1200);
    assert_eq!(output.metrics.get("sampleRate").and_then(|m| m.as_i64()), Some(48_000));
    assert!(output.metrics.contains_key("integratedLufs"));
}
