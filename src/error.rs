use thiserror::Error;

#[derive(Error, Debug)]
pub enum BciError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Insufficient data: window ends at {requested_end:.4}s but newest sample is at {latest:.4}s")]
    InsufficientData { requested_end: f64, latest: f64 },

    #[error("Insufficient labels: training set has {distinct} distinct label(s), need at least 2")]
    InsufficientLabels { distinct: usize },

    #[error("Classifier has not been trained yet")]
    NotTrained,

    #[error("Source disconnected: {0}")]
    SourceDisconnected(String),
}

pub type Result<T> = std::result::Result<T, BciError>;
