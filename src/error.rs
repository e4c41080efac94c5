use thiserror::Error;

/// Errors raised by the engine. Data-quality findings are never reported
/// through this type; they are aggregated into validation results instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported statistical category: {0}")]
    UnsupportedCategory(String),

    #[error("invalid weights from regression analysis: {}", .0.join("; "))]
    InvalidRegressionWeights(Vec<String>),

    #[error("invalid manual weight update: {}", .0.join("; "))]
    InvalidManualWeights(Vec<String>),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("team not found: {0}")]
    TeamNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
