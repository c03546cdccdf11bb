use std::collections::VecDeque;

use crate::error::{BciError, Result};
use crate::tank::DataTank;
use crate::types::{Epoch, Marker};

/// Epochs produced by one build call, plus how many markers were given up on.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub epochs: Vec<Epoch>,
    pub dropped_markers: u64,
}

/// Strategy mapping markers to labeled epoch windows.
///
/// `build_epochs` is called incrementally as markers arrive; a marker whose
/// window is not yet covered by buffered samples yields nothing this call
/// and is retried on later calls, up to a per-paradigm retry bound.
pub trait Paradigm: Send {
    fn build_epochs(&mut self, tank: &DataTank, new_markers: &[Marker]) -> BuildOutcome;

    /// Resolve whatever the buffered history still covers and drop the rest.
    /// Called once at end-of-stream.
    fn flush(&mut self, tank: &DataTank) -> BuildOutcome;

    /// Markers (or open state segments) still waiting for data.
    fn pending(&self) -> usize;
}

/// Configuration for the marker-driven (event-related-potential style)
/// paradigm.
#[derive(Debug, Clone)]
pub struct ErpConfig {
    /// Epoch window `[start, end)` in seconds relative to the marker.
    pub window: (f64, f64),
    /// Optional baseline sub-window relative to the marker; the per-channel
    /// mean over it is subtracted from the epoch.
    pub baseline: Option<(f64, f64)>,
    /// Peak-amplitude rejection threshold; epochs exceeding it are delivered
    /// with `valid = false`.
    pub reject_amplitude: Option<f64>,
    /// Build calls a marker may wait for trailing samples before it is
    /// dropped with a diagnostic.
    pub max_retries: u32,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            window: (0.0, 0.8),
            baseline: None,
            reject_amplitude: None,
            max_retries: 100,
        }
    }
}

/// Marker-driven paradigm: every marker yields exactly one fixed-offset
/// window labeled with the marker's code (P300 / ERP style).
pub struct ErpParadigm {
    config: ErpConfig,
    /// Unresolved markers with their retry counts, in arrival order.
    waiting: VecDeque<(Marker, u32)>,
}

impl ErpParadigm {
    pub fn new(config: ErpConfig) -> Result<Self> {
        if !(config.window.1 > config.window.0) {
            return Err(BciError::Configuration(format!(
                "epoch window ({:.4}, {:.4}) is empty or inverted",
                config.window.0, config.window.1
            )));
        }
        if let Some((b0, b1)) = config.baseline {
            if !(b1 > b0) {
                return Err(BciError::Configuration(format!(
                    "baseline window ({:.4}, {:.4}) is empty or inverted",
                    b0, b1
                )));
            }
        }
        Ok(Self {
            config,
            waiting: VecDeque::new(),
        })
    }

    fn apply_baseline(&self, tank: &DataTank, marker: &Marker, epoch: &mut Epoch) {
        let (b0, b1) = match self.config.baseline {
            Some(bounds) => bounds,
            None => return,
        };
        let baseline = match tank.window(marker.timestamp + b0, marker.timestamp + b1) {
            Ok(b) => b,
            Err(e) => {
                log::warn!(
                    "No baseline data for marker {} at {:.4}s: {}",
                    marker.code,
                    marker.timestamp,
                    e
                );
                return;
            }
        };
        if baseline.n_samples() == 0 {
            return;
        }
        for (channel, reference) in epoch.data.iter_mut().zip(baseline.data.iter()) {
            let mean = reference.iter().sum::<f64>() / reference.len() as f64;
            for value in channel.iter_mut() {
                *value -= mean;
            }
        }
    }

    fn drain(&mut self, tank: &DataTank, force: bool) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        while let Some(&(marker, retries)) = self.waiting.front() {
            match tank.epoch_for(&marker, self.config.window.0, self.config.window.1) {
                Ok(mut epoch) => {
                    self.waiting.pop_front();
                    self.apply_baseline(tank, &marker, &mut epoch);
                    if let Some(threshold) = self.config.reject_amplitude {
                        if epoch.peak_amplitude() > threshold {
                            log::debug!(
                                "Rejecting epoch for marker {} at {:.4}s: peak {:.2} exceeds {:.2}",
                                marker.code,
                                marker.timestamp,
                                epoch.peak_amplitude(),
                                threshold
                            );
                            epoch.valid = false;
                        }
                    }
                    outcome.epochs.push(epoch);
                }
                Err(BciError::InsufficientData { .. })
                    if !force && retries < self.config.max_retries =>
                {
                    // Later markers end even later; keep arrival order and
                    // wait for more samples.
                    if let Some(front) = self.waiting.front_mut() {
                        front.1 += 1;
                    }
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "Dropping marker {} at {:.4}s after {} retries: {}",
                        marker.code,
                        marker.timestamp,
                        retries,
                        e
                    );
                    self.waiting.pop_front();
                    outcome.dropped_markers += 1;
                }
            }
        }
        outcome
    }
}

impl Paradigm for ErpParadigm {
    fn build_epochs(&mut self, tank: &DataTank, new_markers: &[Marker]) -> BuildOutcome {
        for marker in new_markers {
            self.waiting.push_back((*marker, 0));
        }
        self.drain(tank, false)
    }

    fn flush(&mut self, tank: &DataTank) -> BuildOutcome {
        self.drain(tank, true)
    }

    fn pending(&self) -> usize {
        self.waiting.len()
    }
}

/// Configuration for the continuous-state (motor-imagery style) paradigm.
#[derive(Debug, Clone)]
pub struct ContinuousConfig {
    /// Length of each sliding window in seconds.
    pub window_length: f64,
    /// Stride between consecutive window starts in seconds.
    pub stride: f64,
    /// Marker code that closes the active state without opening a new one.
    pub idle_code: i32,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            window_length: 1.0,
            stride: 0.25,
            idle_code: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    code: i32,
    next_start: f64,
    /// Set when a later marker superseded this state; windows must end at or
    /// before it.
    until: Option<f64>,
}

/// Continuous-state paradigm: while a state marker is active, windows slide
/// over the signal at a fixed stride, each labeled with the state's code. A
/// new marker terminates the state at its timestamp.
pub struct ContinuousParadigm {
    config: ContinuousConfig,
    segments: VecDeque<Segment>,
}

impl ContinuousParadigm {
    pub fn new(config: ContinuousConfig) -> Result<Self> {
        if !(config.window_length > 0.0) {
            return Err(BciError::Configuration(format!(
                "window_length must be positive, got {}",
                config.window_length
            )));
        }
        if !(config.stride > 0.0) {
            return Err(BciError::Configuration(format!(
                "stride must be positive, got {}",
                config.stride
            )));
        }
        Ok(Self {
            config,
            segments: VecDeque::new(),
        })
    }

    fn emit(&mut self, tank: &DataTank, force: bool) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        while let Some(segment) = self.segments.front_mut() {
            let mut exhausted = false;
            loop {
                let end = segment.next_start + self.config.window_length;
                if let Some(until) = segment.until {
                    if end > until {
                        exhausted = true;
                        break;
                    }
                }
                match tank.window(segment.next_start, end) {
                    Ok(mut epoch) => {
                        epoch.label = Some(segment.code);
                        epoch.onset = segment.next_start;
                        segment.next_start += self.config.stride;
                        outcome.epochs.push(epoch);
                    }
                    Err(BciError::InsufficientData { .. }) if !force => {
                        // Samples have not caught up; later segments start
                        // even later, so stop here.
                        return outcome;
                    }
                    Err(e) => {
                        if segment.until.is_some() {
                            log::warn!(
                                "Dropping remainder of state {} from {:.4}s: {}",
                                segment.code,
                                segment.next_start,
                                e
                            );
                            outcome.dropped_markers += 1;
                            exhausted = true;
                        }
                        break;
                    }
                }
            }
            if exhausted {
                self.segments.pop_front();
            } else {
                break;
            }
        }
        outcome
    }
}

impl Paradigm for ContinuousParadigm {
    fn build_epochs(&mut self, tank: &DataTank, new_markers: &[Marker]) -> BuildOutcome {
        for marker in new_markers {
            if let Some(open) = self.segments.back_mut() {
                if open.until.is_none() {
                    open.until = Some(marker.timestamp);
                }
            }
            if marker.code != self.config.idle_code {
                self.segments.push_back(Segment {
                    code: marker.code,
                    next_start: marker.timestamp,
                    until: None,
                });
            }
        }
        self.emit(tank, false)
    }

    fn flush(&mut self, tank: &DataTank) -> BuildOutcome {
        let mut outcome = self.emit(tank, true);
        // Whatever is left can never be covered.
        outcome.dropped_markers += self.segments.len() as u64;
        self.segments.clear();
        outcome
    }

    fn pending(&self) -> usize {
        self.segments.len()
    }
}
