use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::classifier::{Classifier, TrainOutcome};
use crate::error::{BciError, Result};
use crate::io::{MarkerSource, Messenger, SignalSource, SourcePoll};
use crate::paradigm::Paradigm;
use crate::tank::DataTank;
use crate::types::Epoch;

/// Which half of `Running` the loop is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    Training,
    Predicting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Configuring,
    Running(RunMode),
    Stopped,
}

/// Per-session options. `online` only changes how source polling is paced;
/// the routing of epochs to training and prediction is identical for live
/// and replayed streams.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Live, time-paced consumption (true) or replay of a finite stream.
    pub online: bool,
    /// Whether the training sub-mode is active during this run.
    pub training: bool,
    /// Predict (and emit) immediately after every successful train. Only
    /// meaningful together with `training`.
    pub live_update: bool,
    /// Sleep between polls on an idle live iteration.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            online: true,
            training: false,
            live_update: false,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Counters for every locally recovered error and emitted message, so a
/// caller can audit a run without it having failed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    pub markers_dropped: u64,
    pub epochs_rejected: u64,
    pub training_batches_skipped: u64,
    pub predictions_skipped: u64,
    pub predictions_sent: u64,
    pub send_failures: u64,
    pub loop_iterations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub diagnostics: Diagnostics,
    pub trained: bool,
}

/// Cloneable external stop request; honored within one loop iteration.
/// In-flight train/predict calls always run to completion.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The orchestrating state machine: `Idle → Configuring → Running(Training |
/// Predicting) → Stopped`.
///
/// Owns the run loop that pulls from both sources into the tank, asks the
/// paradigm for epochs backing newly arrived markers, and routes each epoch
/// to the classifier and messenger according to the current sub-mode.
pub struct BciController {
    signal_source: Box<dyn SignalSource>,
    marker_source: Box<dyn MarkerSource>,
    paradigm: Box<dyn Paradigm>,
    classifier: Box<dyn Classifier>,
    tank: Arc<DataTank>,
    messenger: Box<dyn Messenger>,
    state: ControllerState,
    config: SessionConfig,
    stop: StopHandle,
    diagnostics: Diagnostics,
}

impl BciController {
    pub fn new(
        signal_source: Box<dyn SignalSource>,
        marker_source: Box<dyn MarkerSource>,
        paradigm: Box<dyn Paradigm>,
        classifier: Box<dyn Classifier>,
        tank: Arc<DataTank>,
        messenger: Box<dyn Messenger>,
    ) -> Self {
        Self {
            signal_source,
            marker_source,
            paradigm,
            classifier,
            tank,
            messenger,
            state: ControllerState::Idle,
            config: SessionConfig::default(),
            stop: StopHandle::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Validate the session and classifier configuration and move
    /// `Idle → Configuring`. Fails fast before any data is processed.
    pub fn setup(&mut self, config: SessionConfig) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(BciError::Configuration(format!(
                "setup() requires the Idle state, controller is {:?}",
                self.state
            )));
        }
        self.classifier.config().validate()?;
        if config.live_update && !config.training {
            return Err(BciError::Configuration(
                "live_update requires training to be enabled".to_string(),
            ));
        }
        log::info!(
            "Session configured: online={}, training={}, live_update={}",
            config.online,
            config.training,
            config.live_update
        );
        self.config = config;
        self.state = ControllerState::Configuring;
        Ok(())
    }

    /// Move `Configuring → Running` and drive the pipeline until a stop
    /// request or end-of-stream. Ends in `Stopped` either way; end-of-stream
    /// is normal termination for a replay session and surfaces as
    /// `SourceDisconnected` for a live one.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state != ControllerState::Configuring {
            return Err(BciError::Configuration(format!(
                "run() requires the Configuring state, controller is {:?}",
                self.state
            )));
        }
        let mode = if self.config.training {
            RunMode::Training
        } else {
            RunMode::Predicting
        };
        self.state = ControllerState::Running(mode);
        log::info!("Run loop started in {:?} mode", mode);

        let mut signal_done = false;
        let mut marker_done = false;
        let mut stopped_by_request = false;

        let outcome = loop {
            self.diagnostics.loop_iterations += 1;

            if self.stop.is_stopped() {
                stopped_by_request = true;
                break Ok(());
            }

            // Step 1: drain whatever both sources have.
            let mut idle = true;
            if !signal_done {
                match self.signal_source.pull() {
                    Ok(SourcePoll::Batch(batch)) => {
                        if !batch.is_empty() {
                            idle = false;
                            if let Err(e) = self.tank.append_samples(&batch) {
                                break Err(e);
                            }
                        }
                    }
                    Ok(SourcePoll::EndOfStream) => signal_done = true,
                    Err(e) => break Err(e),
                }
            }
            if !marker_done {
                match self.marker_source.pull() {
                    Ok(SourcePoll::Batch(batch)) => {
                        if !batch.is_empty() {
                            idle = false;
                            if let Err(e) = self.tank.append_markers(&batch) {
                                break Err(e);
                            }
                        }
                    }
                    Ok(SourcePoll::EndOfStream) => marker_done = true,
                    Err(e) => break Err(e),
                }
            }

            // Steps 2 and 3: identical for live and replayed streams.
            let new_markers = self.tank.take_new_markers();
            let built = self.paradigm.build_epochs(&self.tank, &new_markers);
            self.diagnostics.markers_dropped += built.dropped_markers;
            let produced = !built.epochs.is_empty();
            if let Err(e) = self.route_epochs(built.epochs, mode) {
                break Err(e);
            }

            if signal_done && marker_done {
                // No more data will arrive; resolve or drop what is pending.
                let flushed = self.paradigm.flush(&self.tank);
                self.diagnostics.markers_dropped += flushed.dropped_markers;
                if let Err(e) = self.route_epochs(flushed.epochs, mode) {
                    break Err(e);
                }
                break Ok(());
            }

            if self.config.online && idle && !produced {
                std::thread::sleep(self.config.poll_interval);
            }
        };

        self.state = ControllerState::Stopped;
        log::info!(
            "Run loop stopped after {} iterations: {} predictions sent, {} markers dropped",
            self.diagnostics.loop_iterations,
            self.diagnostics.predictions_sent,
            self.diagnostics.markers_dropped
        );

        outcome?;
        if signal_done && marker_done && self.config.online && !stopped_by_request {
            return Err(BciError::SourceDisconnected(
                "live signal and marker sources closed".to_string(),
            ));
        }
        Ok(RunSummary {
            diagnostics: self.diagnostics.clone(),
            trained: self.classifier.is_trained(),
        })
    }

    /// Clear the tank and return to `Idle` for a fresh session. The
    /// classifier keeps its accumulated state.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Idle | ControllerState::Stopped => {
                self.tank.reset();
                self.diagnostics = Diagnostics::default();
                self.stop = StopHandle::default();
                self.state = ControllerState::Idle;
                Ok(())
            }
            other => Err(BciError::Configuration(format!(
                "reset() requires Idle or Stopped state, controller is {:?}",
                other
            ))),
        }
    }

    /// Step 3 of the loop: train and/or predict per epoch, recovering
    /// data-shape and timing errors locally. Only configuration-level
    /// faults propagate.
    fn route_epochs(&mut self, epochs: Vec<Epoch>, mode: RunMode) -> Result<()> {
        for epoch in epochs {
            if !epoch.valid {
                self.diagnostics.epochs_rejected += 1;
                log::debug!(
                    "Skipping rejected epoch at {:.4}s (label {:?})",
                    epoch.onset,
                    epoch.label
                );
                continue;
            }

            if mode == RunMode::Training && epoch.label.is_some() {
                match self.classifier.train(std::slice::from_ref(&epoch)) {
                    Ok(TrainOutcome::Fitted { cv_accuracy }) => {
                        log::info!("Classifier refit, cv accuracy {:.3}", cv_accuracy);
                    }
                    Ok(TrainOutcome::Accumulated { total }) => {
                        log::debug!("Training epoch accumulated ({} total)", total);
                    }
                    Err(BciError::InsufficientLabels { distinct }) => {
                        self.diagnostics.training_batches_skipped += 1;
                        log::warn!(
                            "Training batch skipped: {} distinct label(s) so far",
                            distinct
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            let should_predict = mode == RunMode::Predicting
                || (self.config.live_update && self.classifier.is_trained());
            if should_predict {
                match self.classifier.predict(std::slice::from_ref(&epoch)) {
                    Ok(prediction) => {
                        if self.messenger.send(&prediction) {
                            self.diagnostics.predictions_sent += 1;
                        } else {
                            self.diagnostics.send_failures += 1;
                        }
                    }
                    Err(BciError::NotTrained) => {
                        self.diagnostics.predictions_skipped += 1;
                        log::debug!("Prediction skipped: classifier not trained yet");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, MdmClassifier};
    use crate::io::{MemoryMessenger, ReplaySource};
    use crate::paradigm::{ErpConfig, ErpParadigm};
    use crate::types::{Marker, Sample};

    fn controller_with(
        classifier_config: ClassifierConfig,
        samples: Vec<Sample>,
        markers: Vec<Marker>,
    ) -> (BciController, MemoryMessenger) {
        let tank = Arc::new(DataTank::new(2, 250.0).unwrap());
        let messenger = MemoryMessenger::new();
        let controller = BciController::new(
            Box::new(ReplaySource::new(samples, 100)),
            Box::new(ReplaySource::new(markers, 1)),
            Box::new(
                ErpParadigm::new(ErpConfig {
                    window: (0.0, 1.0),
                    ..Default::default()
                })
                .unwrap(),
            ),
            Box::new(MdmClassifier::new(classifier_config).unwrap()),
            tank,
            Box::new(messenger.clone()),
        );
        (controller, messenger)
    }

    #[test]
    fn test_setup_rejects_contradictory_ratios() {
        let cfg = ClassifierConfig {
            oversample_ratio: 1.0,
            undersample_ratio: 1.0,
            ..Default::default()
        };
        // Construction already validates; the controller surface must too.
        assert!(MdmClassifier::new(cfg).is_err());
    }

    #[test]
    fn test_setup_rejects_live_update_without_training() {
        let (mut controller, _) = controller_with(ClassifierConfig::default(), vec![], vec![]);
        let result = controller.setup(SessionConfig {
            online: false,
            training: false,
            live_update: true,
            ..Default::default()
        });
        assert!(matches!(result, Err(BciError::Configuration(_))));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_run_requires_setup_first() {
        let (mut controller, _) = controller_with(ClassifierConfig::default(), vec![], vec![]);
        assert!(matches!(
            controller.run(),
            Err(BciError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_replay_stops_cleanly() {
        let (mut controller, messenger) =
            controller_with(ClassifierConfig::default(), vec![], vec![]);
        controller
            .setup(SessionConfig {
                online: false,
                training: true,
                live_update: false,
                ..Default::default()
            })
            .unwrap();
        let summary = controller.run().unwrap();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(!summary.trained);
        assert!(messenger.is_empty());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let (mut controller, _) = controller_with(ClassifierConfig::default(), vec![], vec![]);
        controller
            .setup(SessionConfig {
                online: false,
                ..Default::default()
            })
            .unwrap();
        controller.run().unwrap();
        controller.reset().unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
    }
}
