//! Processing results.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::job::{JobId, PayloadRef};

/// A single derived measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Derived metrics keyed by name (e.g. `durationMs`, `integratedLufs`).
pub type Metrics = BTreeMap<String, MetricValue>;

/// Immutable outcome of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessingResult {
    pub job_id: JobId,

    /// Processed audio, absent for measurement-only operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_ref: Option<PayloadRef>,

    #[serde(default)]
    pub metrics: Metrics,

    /// Version of the engine that produced this result
    pub engine_version: String,

    pub created_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn new(
        job_id: JobId,
        processed_ref: Option<PayloadRef>,
        metrics: Metrics,
        engine_version: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            processed_ref,
            metrics,
            engine_version: engine_version.into(),
            created_at: Utc::now(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }
}
