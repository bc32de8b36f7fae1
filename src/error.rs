//! Error types for the Kolosal tabular AutoML core

use thiserror::Error;

/// Result type alias for Kolosal operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the Kolosal tabular core
#[derive(Error, Debug)]
pub enum KolosalError {
    #[error("Search space exhausted: no novel configuration after {retries} retries")]
    SearchSpaceExhausted { retries: usize },

    #[error("Reward attribute '{0}' missing from reported metrics")]
    MissingRewardAttribute(String),

    #[error("Model '{model}' failed to train: {reason}")]
    ModelTrainingFailure { model: String, reason: String },

    #[error("No models were successfully trained")]
    NoModelsTrained,

    #[error("Infeasible split: {0}")]
    InfeasibleSplit(String),

    #[error("Ensemble size must be at least 1, got {0}")]
    EnsembleSizeInvalid(usize),

    #[error("Time budget exhausted before {phase} could start")]
    TimeBudgetExhausted { phase: String },

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Model not fitted")]
    ModelNotFitted,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for KolosalError {
    fn from(err: ndarray::ShapeError) -> Self {
        KolosalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KolosalError::SearchSpaceExhausted { retries: 100 };
        assert_eq!(
            err.to_string(),
            "Search space exhausted: no novel configuration after 100 retries"
        );

        let err = KolosalError::ModelTrainingFailure {
            model: "knn".to_string(),
            reason: "singular matrix".to_string(),
        };
        assert_eq!(err.to_string(), "Model 'knn' failed to train: singular matrix");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KolosalError = io_err.into();
        assert!(matches!(err, KolosalError::IoError(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: KolosalError = json_err.into();
        assert!(matches!(err, KolosalError::SerializationError(_)));
    }
}
