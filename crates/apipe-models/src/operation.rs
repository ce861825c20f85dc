//! Supported audio operations.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Output container/codec for transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Wav,
    Flac,
    Mp3,
    Ogg,
    Opus,
    Aac,
}

impl AudioFormat {
    /// All available formats.
    pub const ALL: &'static [AudioFormat] = &[
        AudioFormat::Wav,
        AudioFormat::Flac,
        AudioFormat::Mp3,
        AudioFormat::Ogg,
        AudioFormat::Opus,
        AudioFormat::Aac,
    ];

    /// File extension used for outputs of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::Aac => "m4a",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Opus => "audio/opus",
            AudioFormat::Aac => "audio/mp4",
        }
    }

    /// Lossless formats ignore bitrate settings.
    pub fn is_lossless(&self) -> bool {
        matches!(self, AudioFormat::Wav | AudioFormat::Flac)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::Aac => "aac",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for AudioFormat {
    type Err = OperationSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "flac" => Ok(AudioFormat::Flac),
            "mp3" => Ok(AudioFormat::Mp3),
            "ogg" => Ok(AudioFormat::Ogg),
            "opus" => Ok(AudioFormat::Opus),
            "aac" | "m4a" => Ok(AudioFormat::Aac),
            _ => Err(OperationSpecError::UnknownFormat(s.to_string())),
        }
    }
}

/// Derived measurement an `ExtractFeatures` operation can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Duration,
    Loudness,
    Peak,
    SampleRate,
    Channels,
}

/// Error raised for malformed or unsupported operation parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationSpecError {
    #[error("Unknown audio format: {0}")]
    UnknownFormat(String),

    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid operation: {0}")]
    Invalid(String),
}

impl OperationSpecError {
    fn out_of_range(field: &'static str, value: impl fmt::Display, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

fn default_target_lufs() -> f64 {
    -16.0
}

fn default_true_peak_db() -> f64 {
    -1.5
}

/// The transform a job applies to its payload.
///
/// Closed set: adding an operation means adding a variant, and every
/// consumer must handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationSpec {
    /// Re-encode into another container/codec
    Transcode {
        format: AudioFormat,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitrate_kbps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<u8>,
    },
    /// EBU R128 loudness normalization
    Normalize {
        #[serde(default = "default_target_lufs")]
        target_lufs: f64,
        #[serde(default = "default_true_peak_db")]
        true_peak_db: f64,
    },
    /// Change the sample rate, keeping the source format
    Resample { sample_rate: u32 },
    /// Cut a window out of the source
    Trim {
        start_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_ms: Option<u64>,
    },
    /// Measure the source without producing new audio
    ExtractFeatures { features: Vec<Feature> },
}

impl OperationSpec {
    /// Normalize with the default broadcast targets.
    pub fn normalize() -> Self {
        OperationSpec::Normalize {
            target_lufs: default_target_lufs(),
            true_peak_db: default_true_peak_db(),
        }
    }

    /// Stable operation name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationSpec::Transcode { .. } => "transcode",
            OperationSpec::Normalize { .. } => "normalize",
            OperationSpec::Resample { .. } => "resample",
            OperationSpec::Trim { .. } => "trim",
            OperationSpec::ExtractFeatures { .. } => "extract_features",
        }
    }

    /// Whether the operation produces a new audio payload.
    pub fn produces_audio(&self) -> bool {
        !matches!(self, OperationSpec::ExtractFeatures { .. })
    }

    /// Canonical JSON form, used for hashing (idempotency and cache keys).
    pub fn canonical_json(&self) -> String {
        // Struct fields serialize in declaration order, so this is stable.
        serde_json::to_string(self).unwrap_or_else(|_| self.kind().to_string())
    }

    /// Check parameters before a job is created or processed.
    pub fn validate(&self) -> Result<(), OperationSpecError> {
        match self {
            OperationSpec::Transcode {
                format,
                bitrate_kbps,
                sample_rate,
                channels,
            } => {
                if let Some(bitrate) = bitrate_kbps {
                    if format.is_lossless() {
                        return Err(OperationSpecError::Invalid(format!(
                            "bitrate is not applicable to lossless format {}",
                            format
                        )));
                    }
                    if !(8..=640).contains(bitrate) {
                        return Err(OperationSpecError::out_of_range(
                            "bitrate_kbps",
                            bitrate,
                            "8..=640",
                        ));
                    }
                }
                if let Some(rate) = sample_rate {
                    validate_sample_rate(*rate)?;
                }
                if let Some(ch) = channels {
                    if !(1..=8).contains(ch) {
                        return Err(OperationSpecError::out_of_range("channels", ch, "1..=8"));
                    }
                }
                Ok(())
            }
            OperationSpec::Normalize {
                target_lufs,
                true_peak_db,
            } => {
                if !target_lufs.is_finite() || !(-70.0..=-5.0).contains(target_lufs) {
                    return Err(OperationSpecError::out_of_range(
                        "target_lufs",
                        target_lufs,
                        "-70.0..=-5.0",
                    ));
                }
                if !true_peak_db.is_finite() || !(-9.0..=0.0).contains(true_peak_db) {
                    return Err(OperationSpecError::out_of_range(
                        "true_peak_db",
                        true_peak_db,
                        "-9.0..=0.0",
                    ));
                }
                Ok(())
            }
            OperationSpec::Resample { sample_rate } => validate_sample_rate(*sample_rate),
            OperationSpec::Trim { start_ms, end_ms } => match end_ms {
                Some(end) if end <= start_ms => Err(OperationSpecError::Invalid(format!(
                    "trim end ({}ms) must be after start ({}ms)",
                    end, start_ms
                ))),
                _ => Ok(()),
            },
            OperationSpec::ExtractFeatures { features } => {
                if features.is_empty() {
                    Err(OperationSpecError::Invalid(
                        "extract_features requires at least one feature".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn validate_sample_rate(rate: u32) -> Result<(), OperationSpecError> {
    if (8_000..=192_000).contains(&rate) {
        Ok(())
    } else {
        Err(OperationSpecError::out_of_range(
            "sample_rate",
            rate,
            "8000..=192000",
        ))
    }
}

impl fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}
