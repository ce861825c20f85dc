//! FFmpeg-backed audio engine.

use std::path::Path;
use std::process::Stdio;

use apipe_models::{AudioFormat, Feature, MetricValue, Metrics, OperationSpec};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
use crate::engine::{AudioEngine, AudioInput, EngineOutput};
use crate::error::{EngineError, EngineResult};
use crate::probe::{probe_audio, AudioInfo};

/// Bumped whenever command construction changes output for the same input.
pub const ENGINE_REVISION: u32 = 1;

/// Loudness range target passed to `loudnorm`.
const LOUDNORM_LRA: f64 = 11.0;

/// Engine that shells out to `ffmpeg`/`ffprobe`.
///
/// Every invocation works inside its own temporary directory, which is
/// removed on drop whether processing succeeded or not.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    version: String,
    runner: FfmpegRunner,
}

impl FfmpegEngine {
    /// Create an engine for a known FFmpeg version string.
    pub fn new(ffmpeg_version: impl AsRef<str>) -> Self {
        Self {
            version: format!("apipe-ffmpeg/{} (ffmpeg {})", ENGINE_REVISION, ffmpeg_version.as_ref()),
            runner: FfmpegRunner::new(),
        }
    }

    /// Locate FFmpeg and read its version.
    pub async fn detect() -> EngineResult<Self> {
        check_ffmpeg()?;

        let output = Command::new("ffmpeg")
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_ffmpeg_version(&stdout).unwrap_or("unknown");
        info!(ffmpeg_version = version, "Detected FFmpeg");

        Ok(Self::new(version))
    }

    /// Kill FFmpeg invocations that run longer than `secs`.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.runner = self.runner.with_timeout(secs);
        self
    }

    async fn transform(
        &self,
        dir: &Path,
        input_path: &Path,
        source: AudioFormat,
        op: &OperationSpec,
    ) -> EngineResult<EngineOutput> {
        let format = output_format(op, source);
        let output_path = dir.join(format!("output.{}", format.extension()));

        let mut cmd = build_command(op, input_path, &output_path, source);
        if matches!(op, OperationSpec::Normalize { .. }) {
            // loudnorm upsamples internally; keep the source rate
            let source_info = probe_audio(input_path).await?;
            if source_info.sample_rate > 0 {
                cmd = cmd.sample_rate(source_info.sample_rate);
            }
        }
        let stderr = self.runner.run(&cmd).await?;

        let mut metrics = Metrics::new();
        if matches!(op, OperationSpec::Normalize { .. }) {
            match parse_loudnorm(&stderr) {
                Some(report) => {
                    insert_finite(&mut metrics, "integratedLufs", report.output_i());
                    insert_finite(&mut metrics, "truePeakDb", report.output_tp());
                    insert_finite(&mut metrics, "sourceLufs", report.input_i());
                }
                None => debug!("loudnorm report missing from FFmpeg output"),
            }
        }

        let info = probe_audio(&output_path).await?;
        insert_info(&mut metrics, &info);

        let bytes = tokio::fs::read(&output_path).await?;
        Ok(EngineOutput::audio(bytes, format, metrics))
    }

    async fn extract_features(
        &self,
        input_path: &Path,
        op: &OperationSpec,
        features: &[Feature],
    ) -> EngineResult<EngineOutput> {
        let info = probe_audio(input_path).await?;
        let mut metrics = Metrics::new();

        for feature in features {
            match feature {
                Feature::Duration => {
                    metrics.insert("durationMs".to_string(), info.duration_ms().into());
                }
                Feature::SampleRate => {
                    metrics.insert("sampleRate".to_string(), info.sample_rate.into());
                }
                Feature::Channels => {
                    metrics.insert("channels".to_string(), info.channels.into());
                }
                Feature::Loudness | Feature::Peak => {}
            }
        }

        let wants_loudness = features
            .iter()
            .any(|f| matches!(f, Feature::Loudness | Feature::Peak));
        if wants_loudness {
            let cmd = build_command(op, input_path, Path::new(""), AudioFormat::Wav);
            let stderr = self.runner.run(&cmd).await?;
            let report = parse_loudnorm(&stderr)
                .ok_or_else(|| EngineError::failed("loudnorm analysis produced no report"))?;

            if features.contains(&Feature::Loudness) {
                insert_finite(&mut metrics, "integratedLufs", report.input_i());
                insert_finite(&mut metrics, "loudnessRange", report.input_lra());
            }
            if features.contains(&Feature::Peak) {
                insert_finite(&mut metrics, "truePeakDb", report.input_tp());
            }
        }

        Ok(EngineOutput::metrics_only(metrics))
    }
}

#[async_trait]
impl AudioEngine for FfmpegEngine {
    fn version(&self) -> &str {
        &self.version
    }

    async fn process(&self, input: &AudioInput, op: &OperationSpec) -> EngineResult<EngineOutput> {
        op.validate()?;

        if input.bytes.is_empty() {
            return Err(EngineError::invalid_audio("empty input"));
        }

        let dir = tempfile::tempdir()?;
        let source = input.source_format();
        let input_path = dir.path().join(format!("input.{}", source.extension()));
        tokio::fs::write(&input_path, &input.bytes).await?;

        debug!(
            op = op.kind(),
            input_bytes = input.bytes.len(),
            "Running FFmpeg engine"
        );

        match op {
            OperationSpec::ExtractFeatures { features } => {
                self.extract_features(&input_path, op, features).await
            }
            _ => self.transform(dir.path(), &input_path, source, op).await,
        }
    }
}

/// Format of the processed audio. Only transcoding changes the container.
pub fn output_format(op: &OperationSpec, source: AudioFormat) -> AudioFormat {
    match op {
        OperationSpec::Transcode { format, .. } => *format,
        _ => source,
    }
}

/// Encoder used for a target format.
pub fn codec_for(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Wav => "pcm_s16le",
        AudioFormat::Flac => "flac",
        AudioFormat::Mp3 => "libmp3lame",
        AudioFormat::Ogg => "libvorbis",
        AudioFormat::Opus => "libopus",
        AudioFormat::Aac => "aac",
    }
}

fn loudnorm_filter(target_lufs: f64, true_peak_db: f64) -> String {
    format!(
        "loudnorm=I={:.1}:TP={:.1}:LRA={:.1}:print_format=json",
        target_lufs, true_peak_db, LOUDNORM_LRA
    )
}

/// Build the FFmpeg invocation for an operation.
///
/// For `ExtractFeatures` this is the loudness analysis pass and `output` is
/// ignored.
pub fn build_command(
    op: &OperationSpec,
    input: &Path,
    output: &Path,
    source: AudioFormat,
) -> FfmpegCommand {
    match op {
        OperationSpec::Transcode {
            format,
            bitrate_kbps,
            sample_rate,
            channels,
        } => {
            let mut cmd = FfmpegCommand::new(input, output)
                .no_video()
                .audio_codec(codec_for(*format));
            if let Some(kbps) = (*bitrate_kbps).filter(|_| !format.is_lossless()) {
                cmd = cmd.audio_bitrate(kbps);
            }
            if let Some(hz) = sample_rate {
                cmd = cmd.sample_rate(*hz);
            }
            if let Some(ch) = channels {
                cmd = cmd.channels(*ch);
            }
            cmd
        }
        OperationSpec::Normalize {
            target_lufs,
            true_peak_db,
        } => FfmpegCommand::new(input, output)
            .no_video()
            .audio_filter(loudnorm_filter(*target_lufs, *true_peak_db))
            .audio_codec(codec_for(source))
            .log_level("info"),
        OperationSpec::Resample { sample_rate } => FfmpegCommand::new(input, output)
            .no_video()
            .sample_rate(*sample_rate)
            .audio_codec(codec_for(source)),
        OperationSpec::Trim { start_ms, end_ms } => {
            let mut cmd = FfmpegCommand::new(input, output).seek(*start_ms as f64 / 1000.0);
            if let Some(end) = end_ms {
                cmd = cmd.duration(end.saturating_sub(*start_ms) as f64 / 1000.0);
            }
            cmd.no_video().audio_codec(codec_for(source))
        }
        OperationSpec::ExtractFeatures { .. } => FfmpegCommand::analyze(input)
            .audio_filter(loudnorm_filter(-16.0, -1.5))
            .log_level("info"),
    }
}

/// `loudnorm` analysis block (all values are strings in FFmpeg's output).
#[derive(Debug, Clone, Deserialize)]
pub struct LoudnormReport {
    pub input_i: String,
    pub input_tp: String,
    pub input_lra: String,
    #[serde(default)]
    pub output_i: Option<String>,
    #[serde(default)]
    pub output_tp: Option<String>,
}

impl LoudnormReport {
    pub fn input_i(&self) -> Option<f64> {
        self.input_i.trim().parse().ok()
    }

    pub fn input_tp(&self) -> Option<f64> {
        self.input_tp.trim().parse().ok()
    }

    pub fn input_lra(&self) -> Option<f64> {
        self.input_lra.trim().parse().ok()
    }

    pub fn output_i(&self) -> Option<f64> {
        self.output_i.as_deref().and_then(|v| v.trim().parse().ok())
    }

    pub fn output_tp(&self) -> Option<f64> {
        self.output_tp.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

/// Extract the trailing `loudnorm` JSON block from FFmpeg stderr.
pub fn parse_loudnorm(stderr: &str) -> Option<LoudnormReport> {
    let start = stderr.rfind('{')?;
    let end = stderr[start..].find('}')? + start;
    serde_json::from_str(&stderr[start..=end]).ok()
}

/// First line of `ffmpeg -version` is `ffmpeg version <version> ...`.
fn parse_ffmpeg_version(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .next()?
        .strip_prefix("ffmpeg version ")?
        .split_whitespace()
        .next()
}

// Infinite values (silence measures -inf) have no JSON form.
fn insert_finite(metrics: &mut Metrics, name: &str, value: Option<f64>) {
    if let Some(v) = value.filter(|v| v.is_finite()) {
        metrics.insert(name.to_string(), MetricValue::Float(v));
    }
}

fn insert_info(metrics: &mut Metrics, info: &AudioInfo) {
    metrics.insert("durationMs".to_string(), info.duration_ms().into());
    metrics.insert("sampleRate".to_string(), info.sample_rate.into());
    metrics.insert("channels".to_string(), info.channels.into());
    metrics.insert("codec".to_string(), info.codec.clone().into());
    metrics.insert("sizeBytes".to_string(), MetricValue::Int(info.size as i64));
}
