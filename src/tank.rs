use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{BciError, Result};
use crate::types::{Epoch, Marker, Sample};

/// Tolerance for timestamp comparisons, well below one tick at any
/// physiological sampling rate.
const TIME_EPS: f64 = 1e-9;

#[derive(Debug, Default)]
struct TankInner {
    /// Sample timestamps in arrival order (strictly increasing).
    timestamps: Vec<f64>,
    /// Row-major sample values, `n_channels` per timestamp.
    values: Vec<f64>,
    markers: Vec<Marker>,
    /// Markers below this index have already been handed out by
    /// `take_new_markers`.
    marker_cursor: usize,
    rejected_samples: u64,
    rejected_markers: u64,
}

/// Counters and bounds describing the tank's current history.
#[derive(Debug, Clone, Serialize)]
pub struct TankStats {
    pub n_samples: usize,
    pub n_markers: usize,
    pub rejected_samples: u64,
    pub rejected_markers: u64,
    pub first_timestamp: Option<f64>,
    pub latest_timestamp: Option<f64>,
}

/// Append-only, time-indexed store of the session's samples and markers.
///
/// This is the single shared mutable structure of the pipeline. Appends are
/// serialized through an internal write lock; readers copy the requested
/// range out under a read lock, so concurrent reads during appends are safe
/// and a delivered epoch is immune to later growth.
///
/// Storage is a flat growable buffer with a parallel timestamp index;
/// appends are O(1) amortized and range lookups are a binary search over
/// the index.
pub struct DataTank {
    n_channels: usize,
    sample_rate: f64,
    inner: RwLock<TankInner>,
}

impl DataTank {
    pub fn new(n_channels: usize, sample_rate: f64) -> Result<Self> {
        if n_channels == 0 {
            return Err(BciError::Configuration(
                "DataTank requires at least one channel".to_string(),
            ));
        }
        if !(sample_rate > 0.0) {
            return Err(BciError::Configuration(format!(
                "DataTank sample rate must be positive, got {}",
                sample_rate
            )));
        }
        Ok(Self {
            n_channels,
            sample_rate,
            inner: RwLock::new(TankInner::default()),
        })
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Append a batch of samples, returning how many were accepted.
    ///
    /// Samples whose timestamp does not strictly increase over the newest
    /// stored one are counted and skipped, never reordered. A channel-count
    /// mismatch is a session-level fault and fails the whole call.
    pub fn append_samples(&self, batch: &[Sample]) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut accepted = 0;
        for sample in batch {
            if sample.channels.len() != self.n_channels {
                return Err(BciError::Configuration(format!(
                    "sample at {:.4}s has {} channels, tank is configured for {}",
                    sample.timestamp,
                    sample.channels.len(),
                    self.n_channels
                )));
            }
            if let Some(&last) = inner.timestamps.last() {
                if sample.timestamp <= last + TIME_EPS {
                    log::warn!(
                        "Rejecting out-of-order sample at {:.6}s (newest is {:.6}s)",
                        sample.timestamp,
                        last
                    );
                    inner.rejected_samples += 1;
                    continue;
                }
            }
            inner.timestamps.push(sample.timestamp);
            inner.values.extend_from_slice(&sample.channels);
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Append a batch of markers under the same monotonicity discipline.
    pub fn append_markers(&self, batch: &[Marker]) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut accepted = 0;
        for marker in batch {
            if let Some(last) = inner.markers.last() {
                if marker.timestamp <= last.timestamp + TIME_EPS {
                    log::warn!(
                        "Rejecting out-of-order marker {} at {:.6}s (newest is {:.6}s)",
                        marker.code,
                        marker.timestamp,
                        last.timestamp
                    );
                    inner.rejected_markers += 1;
                    continue;
                }
            }
            inner.markers.push(*marker);
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Markers appended since the previous call.
    pub fn take_new_markers(&self) -> Vec<Marker> {
        let mut inner = self.inner.write();
        let cursor = inner.marker_cursor;
        inner.marker_cursor = inner.markers.len();
        inner.markers[cursor..].to_vec()
    }

    /// Timestamp of the newest stored sample.
    pub fn latest_timestamp(&self) -> Option<f64> {
        self.inner.read().timestamps.last().copied()
    }

    /// Carve the epoch backing `marker` with the given window offsets.
    ///
    /// The returned epoch carries the marker's code as its label. Queries
    /// are non-destructive and repeatable: the same marker queried twice
    /// yields the same epoch.
    pub fn epoch_for(&self, marker: &Marker, offset_start: f64, offset_end: f64) -> Result<Epoch> {
        let mut epoch = self.window(
            marker.timestamp + offset_start,
            marker.timestamp + offset_end,
        )?;
        epoch.label = Some(marker.code);
        epoch.onset = marker.timestamp;
        Ok(epoch)
    }

    /// Copy out the samples covering the half-open window `[start, end)`.
    ///
    /// Fails with `InsufficientData` while the window still extends past the
    /// newest received sample (the caller may retry as data arrives). Once
    /// the history reaches past `end`, a window that is still short of the
    /// expected sample count (a gap in the stream) is returned with
    /// `valid = false` rather than silently truncated.
    pub fn window(&self, start: f64, end: f64) -> Result<Epoch> {
        if !(end > start) {
            return Err(BciError::Configuration(format!(
                "window [{:.4}, {:.4}) is empty or inverted",
                start, end
            )));
        }

        let inner = self.inner.read();
        let latest = match inner.timestamps.last() {
            Some(&t) => t,
            None => {
                return Err(BciError::InsufficientData {
                    requested_end: end,
                    latest: f64::NEG_INFINITY,
                })
            }
        };

        let expected = ((end - start) * self.sample_rate).round() as usize;
        // Ties at either boundary resolve toward exclusion of the end sample,
        // keeping the window length exactly as configured.
        let lo = inner.timestamps.partition_point(|&t| t < start - TIME_EPS);
        let hi = inner.timestamps.partition_point(|&t| t < end - TIME_EPS);
        let n = hi - lo;

        if n < expected && latest < end - TIME_EPS {
            return Err(BciError::InsufficientData {
                requested_end: end,
                latest,
            });
        }

        let mut data = vec![Vec::with_capacity(n); self.n_channels];
        for idx in lo..hi {
            let row = &inner.values[idx * self.n_channels..(idx + 1) * self.n_channels];
            for (channel, &value) in data.iter_mut().zip(row.iter()) {
                channel.push(value);
            }
        }

        if n != expected {
            log::debug!(
                "Window [{:.4}, {:.4}) holds {} samples, expected {}",
                start,
                end,
                n,
                expected
            );
        }

        Ok(Epoch {
            label: None,
            onset: start,
            start,
            end,
            data,
            valid: n == expected,
        })
    }

    /// Discard the whole history. Only called at session reset.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        *inner = TankInner::default();
        log::info!("DataTank reset");
    }

    pub fn stats(&self) -> TankStats {
        let inner = self.inner.read();
        TankStats {
            n_samples: inner.timestamps.len(),
            n_markers: inner.markers.len(),
            rejected_samples: inner.rejected_samples,
            rejected_markers: inner.rejected_markers,
            first_timestamp: inner.timestamps.first().copied(),
            latest_timestamp: inner.timestamps.last().copied(),
        }
    }
}
