use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bci_rs::{
    BciController, BciError, Classifier, ClassifierConfig, ControllerState, DataTank, Epoch,
    ErpConfig, ErpParadigm, Marker, MdmClassifier, MemoryMessenger, Prediction, QueueSource,
    ReplaySource, Result, Sample, SessionConfig, TrainOutcome,
};

const SAMPLE_RATE: f64 = 250.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two-channel sinusoidal signal covering `[0, seconds)`.
fn session_samples(seconds: f64) -> Vec<Sample> {
    let n = (seconds * SAMPLE_RATE) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE;
            Sample::new(
                t,
                vec![
                    (2.0 * std::f64::consts::PI * 10.0 * t).sin(),
                    0.5 * (2.0 * std::f64::consts::PI * 6.0 * t).cos(),
                ],
            )
        })
        .collect()
}

/// Ten markers at whole seconds, alternating labels {1, 2}.
fn session_markers() -> Vec<Marker> {
    (1..=10)
        .map(|k| Marker::new(if k % 2 == 1 { 1 } else { 2 }, k as f64))
        .collect()
}

fn classifier_config() -> ClassifierConfig {
    ClassifierConfig {
        n_splits: 2,
        random_seed: 11,
        ..Default::default()
    }
}

fn erp_paradigm() -> ErpParadigm {
    ErpParadigm::new(ErpConfig {
        window: (0.0, 1.0),
        ..Default::default()
    })
    .unwrap()
}

/// Like [`erp_paradigm`] but never gives up on a marker; end-of-stream
/// flushing is the only way one is dropped. Keeps tests that pace delivery
/// from another thread independent of wall-clock scheduling.
fn patient_erp_paradigm() -> ErpParadigm {
    ErpParadigm::new(ErpConfig {
        window: (0.0, 1.0),
        max_retries: u32::MAX,
        ..Default::default()
    })
    .unwrap()
}

fn offline_controller_with(
    paradigm: ErpParadigm,
    samples: Vec<Sample>,
    markers: Vec<Marker>,
) -> (BciController, MemoryMessenger) {
    let tank = Arc::new(DataTank::new(2, SAMPLE_RATE).unwrap());
    let messenger = MemoryMessenger::new();
    let controller = BciController::new(
        Box::new(ReplaySource::new(samples, 125)),
        Box::new(ReplaySource::new(markers, 1)),
        Box::new(paradigm),
        Box::new(MdmClassifier::new(classifier_config()).unwrap()),
        tank,
        Box::new(messenger.clone()),
    );
    (controller, messenger)
}

fn offline_controller(
    samples: Vec<Sample>,
    markers: Vec<Marker>,
) -> (BciController, MemoryMessenger) {
    offline_controller_with(erp_paradigm(), samples, markers)
}

fn emitted_labels(predictions: &[Prediction]) -> Vec<Vec<i32>> {
    predictions.iter().map(|p| p.labels.clone()).collect()
}

#[test]
fn test_epoch_queries_are_idempotent() {
    init_logging();
    let tank = DataTank::new(2, SAMPLE_RATE).unwrap();
    tank.append_samples(&session_samples(3.0)).unwrap();
    let marker = Marker::new(1, 1.0);

    let first = tank.epoch_for(&marker, 0.0, 1.0).unwrap();
    assert_eq!(first.n_samples(), 250);

    tank.append_samples(&session_samples(3.0).iter().map(|s| Sample::new(s.timestamp + 3.0, s.channels.clone())).collect::<Vec<_>>())
        .unwrap();
    let second = tank.epoch_for(&marker, 0.0, 1.0).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_windows_are_never_silently_short() {
    init_logging();
    let tank = DataTank::new(2, SAMPLE_RATE).unwrap();
    tank.append_samples(&session_samples(1.5)).unwrap();
    // Trailing data for this marker has not arrived yet.
    let result = tank.epoch_for(&Marker::new(1, 1.0), 0.0, 1.0);
    assert!(matches!(result, Err(BciError::InsufficientData { .. })));
}

#[test]
fn test_predicting_without_training_skips_and_counts() {
    init_logging();
    let (mut controller, messenger) = offline_controller(session_samples(12.0), session_markers());
    controller
        .setup(SessionConfig {
            online: false,
            training: false,
            live_update: false,
            ..Default::default()
        })
        .unwrap();

    let summary = controller.run().unwrap();
    assert!(!summary.trained);
    assert!(messenger.is_empty());
    assert_eq!(summary.diagnostics.predictions_skipped, 10);
}

#[test]
fn test_contradictory_resampling_is_rejected_before_any_data() {
    init_logging();
    let config = ClassifierConfig {
        oversample_ratio: 0.5,
        undersample_ratio: 0.5,
        ..Default::default()
    };
    assert!(matches!(
        MdmClassifier::new(config.clone()),
        Err(BciError::Configuration(_))
    ));

    // A classifier that slipped through construction is still caught by
    // setup() before run() can start.
    struct Stub(ClassifierConfig);
    impl Classifier for Stub {
        fn config(&self) -> &ClassifierConfig {
            &self.0
        }
        fn is_trained(&self) -> bool {
            false
        }
        fn train(&mut self, _: &[Epoch]) -> Result<TrainOutcome> {
            Ok(TrainOutcome::Accumulated { total: 0 })
        }
        fn predict(&mut self, _: &[Epoch]) -> Result<Prediction> {
            Err(BciError::NotTrained)
        }
    }

    let tank = Arc::new(DataTank::new(2, SAMPLE_RATE).unwrap());
    let mut controller = BciController::new(
        Box::new(ReplaySource::new(Vec::<Sample>::new(), 1)),
        Box::new(ReplaySource::new(Vec::<Marker>::new(), 1)),
        Box::new(erp_paradigm()),
        Box::new(Stub(config)),
        tank,
        Box::new(MemoryMessenger::new()),
    );
    let result = controller.setup(SessionConfig {
        online: false,
        ..Default::default()
    });
    assert!(matches!(result, Err(BciError::Configuration(_))));
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn test_end_to_end_training_with_live_update() {
    init_logging();
    let (mut controller, messenger) = offline_controller(session_samples(12.0), session_markers());
    controller
        .setup(SessionConfig {
            online: false,
            training: true,
            live_update: true,
            ..Default::default()
        })
        .unwrap();

    let summary = controller.run().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert!(summary.trained);

    // With n_splits = 2 the classifier fits at the 4th labeled epoch, so
    // markers 4 through 10 each emit exactly one prediction, in order.
    let sent = messenger.sent();
    assert_eq!(sent.len(), 7);
    assert_eq!(summary.diagnostics.predictions_sent, 7);
    assert_eq!(summary.diagnostics.markers_dropped, 0);
    for prediction in &sent {
        assert_eq!(prediction.labels.len(), 1);
        let scores = prediction.scores.as_ref().unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].len(), prediction.class_labels.len());
    }
}

#[test]
fn test_online_and_offline_runs_emit_identical_predictions() {
    init_logging();
    let samples = session_samples(12.0);
    let markers = session_markers();

    // Offline replay. Both runs use the unbounded retry budget so the
    // comparison is between identical configurations.
    let (mut offline, offline_messenger) =
        offline_controller_with(patient_erp_paradigm(), samples.clone(), markers.clone());
    offline
        .setup(SessionConfig {
            online: false,
            training: true,
            live_update: true,
            ..Default::default()
        })
        .unwrap();
    offline.run().unwrap();

    // Live run, fed from a producer thread in timed chunks.
    let (sample_tx, sample_source) = QueueSource::<Sample>::channel();
    let (marker_tx, marker_source) = QueueSource::<Marker>::channel();
    let feeder = {
        let samples = samples.clone();
        let markers = markers.clone();
        thread::spawn(move || {
            let mut next_marker = 0;
            for chunk in samples.chunks(125) {
                sample_tx.push(chunk.to_vec());
                let delivered = chunk.last().map(|s| s.timestamp).unwrap_or(0.0);
                while next_marker < markers.len() && markers[next_marker].timestamp <= delivered {
                    marker_tx.push([markers[next_marker]]);
                    next_marker += 1;
                }
                thread::sleep(Duration::from_millis(1));
            }
            sample_tx.close();
            marker_tx.close();
        })
    };

    let tank = Arc::new(DataTank::new(2, SAMPLE_RATE).unwrap());
    let online_messenger = MemoryMessenger::new();
    let mut online = BciController::new(
        Box::new(sample_source),
        Box::new(marker_source),
        Box::new(patient_erp_paradigm()),
        Box::new(MdmClassifier::new(classifier_config()).unwrap()),
        tank,
        Box::new(online_messenger.clone()),
    );
    online
        .setup(SessionConfig {
            online: true,
            training: true,
            live_update: true,
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();

    // A live run terminated by its sources surfaces the disconnect after the
    // orderly stop.
    let result = online.run();
    assert!(matches!(result, Err(BciError::SourceDisconnected(_))));
    assert_eq!(online.state(), ControllerState::Stopped);
    feeder.join().unwrap();

    let offline_sent = offline_messenger.sent();
    let online_sent = online_messenger.sent();
    assert_eq!(emitted_labels(&offline_sent), emitted_labels(&online_sent));
    let offline_scores: Vec<_> = offline_sent.iter().map(|p| p.scores.clone()).collect();
    let online_scores: Vec<_> = online_sent.iter().map(|p| p.scores.clone()).collect();
    assert_eq!(offline_scores, online_scores);
}

#[test]
fn test_unresolvable_marker_is_dropped_with_diagnostic() {
    init_logging();
    // The last marker's window needs samples up to 11.0s but the stream
    // stops at 10.2s.
    let (mut controller, messenger) =
        offline_controller(session_samples(10.2), session_markers());
    controller
        .setup(SessionConfig {
            online: false,
            training: true,
            live_update: true,
            ..Default::default()
        })
        .unwrap();

    let summary = controller.run().unwrap();
    assert_eq!(summary.diagnostics.markers_dropped, 1);
    // Markers 4..=9 still produce predictions.
    assert_eq!(messenger.len(), 6);
}

#[test]
fn test_stop_request_is_honored_within_one_iteration() {
    init_logging();
    let (sample_tx, sample_source) = QueueSource::<Sample>::channel();
    let (_marker_tx, marker_source) = QueueSource::<Marker>::channel();
    sample_tx.push(session_samples(1.0));

    let tank = Arc::new(DataTank::new(2, SAMPLE_RATE).unwrap());
    let mut controller = BciController::new(
        Box::new(sample_source),
        Box::new(marker_source),
        Box::new(erp_paradigm()),
        Box::new(MdmClassifier::new(classifier_config()).unwrap()),
        tank,
        Box::new(MemoryMessenger::new()),
    );
    controller
        .setup(SessionConfig {
            online: true,
            training: true,
            live_update: false,
            poll_interval: Duration::from_millis(1),
        })
        .unwrap();

    let stop = controller.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        stop.stop();
    });

    let summary = controller.run().unwrap();
    stopper.join().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert!(summary.diagnostics.loop_iterations >= 1);
}
