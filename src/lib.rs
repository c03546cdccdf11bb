//! Real-time brain-computer interface pipeline: continuous multi-channel
//! signal ingestion, marker-aligned epoch extraction, online/offline
//! classifier training and inference, and prediction emission.

pub mod classifier;
pub mod controller;
pub mod error;
pub mod io;
pub mod paradigm;
pub mod tank;
pub mod types;

pub use classifier::{Classifier, ClassifierConfig, MdmClassifier, TrainOutcome};
pub use controller::{
    BciController, ControllerState, Diagnostics, RunMode, RunSummary, SessionConfig, StopHandle,
};
pub use error::{BciError, Result};
pub use io::{
    LogMessenger, MarkerSource, MemoryMessenger, Messenger, QueueProducer, QueueSource,
    ReplaySource, SignalSource, SourcePoll,
};
pub use paradigm::{
    BuildOutcome, ContinuousConfig, ContinuousParadigm, ErpConfig, ErpParadigm, Paradigm,
};
pub use tank::{DataTank, TankStats};
pub use types::{Epoch, Marker, Prediction, Sample};
