use serde::{Deserialize, Serialize};

/// One multi-channel measurement with its acquisition timestamp.
///
/// Timestamps are seconds in the shared session clock domain. Within one
/// source, timestamps must strictly increase in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub channels: Vec<f64>,
}

impl Sample {
    pub fn new(timestamp: f64, channels: Vec<f64>) -> Self {
        Self {
            timestamp,
            channels,
        }
    }
}

/// Discrete event code in the same clock domain as the samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub code: i32,
    pub timestamp: f64,
}

impl Marker {
    pub fn new(code: i32, timestamp: f64) -> Self {
        Self { code, timestamp }
    }
}

/// A fixed-duration window of samples anchored to a moment in the session.
///
/// `data` is `[channel][sample]`, copied out of the tank at extraction time;
/// later appends can never change a delivered epoch. `valid` is false when
/// the buffered history could not fully cover `[start, end)` (e.g. dropped
/// samples left a gap) or a paradigm rejection rule fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    /// Label carried over from the originating marker, if any.
    pub label: Option<i32>,
    /// Timestamp of the anchoring event (marker or window start).
    pub onset: f64,
    /// Window bounds, half-open `[start, end)`.
    pub start: f64,
    pub end: f64,
    pub data: Vec<Vec<f64>>,
    pub valid: bool,
}

impl Epoch {
    pub fn n_channels(&self) -> usize {
        self.data.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.first().map(|row| row.len()).unwrap_or(0)
    }

    /// Largest absolute value across all channels and samples.
    pub fn peak_amplitude(&self) -> f64 {
        self.data
            .iter()
            .flat_map(|row| row.iter())
            .fold(0.0_f64, |acc, &v| acc.max(v.abs()))
    }
}

/// Output of one classifier invocation: one label per input epoch, in input
/// order, with an optional per-class score row for each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub labels: Vec<i32>,
    /// One row per input epoch; columns follow `class_labels`.
    pub scores: Option<Vec<Vec<f64>>>,
    /// Label ordering of the score columns.
    pub class_labels: Vec<i32>,
    pub created_at: String,
}

impl Prediction {
    pub fn new(labels: Vec<i32>, scores: Option<Vec<Vec<f64>>>, class_labels: Vec<i32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            labels,
            scores,
            class_labels,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
