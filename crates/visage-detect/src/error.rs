use thiserror::Error;

/// Errors surfaced by the detection pipeline.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("classifier failure: {0}")]
    Classifier(String),

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("model error: {0}")]
    Model(String),
}
