use thiserror::Error;

/// Main error type for the OnlineTune system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Learner error: {0}")]
    Learner(#[from] LearnerError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tuner service is closed")]
    ServiceClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown {kind} policy: {name}")]
    UnknownPolicy { kind: String, name: String },

    #[error("Unsupported {kind} policy: {name}")]
    Unsupported { kind: String, name: String },

    #[error("Missing hyperparameter: {name}")]
    MissingParameter { name: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors raised while building or driving an online learner
#[derive(Error, Debug)]
pub enum LearnerError {
    #[error("Invalid learner configuration for {parameter}: {message}")]
    InvalidConfig { parameter: String, message: String },

    #[error("Learner construction failed: {message}")]
    BuildFailed { message: String },
}

/// Errors raised by the local-search collaborator
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Parameter {name} is not part of the search space")]
    UnknownParameter { name: String },

    #[error("Empty domain for parameter {name}")]
    EmptyDomain { name: String },

    #[error("Search space has no tunable dimensions")]
    NoDimensions,
}

/// Errors raised while parsing data samples
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Empty sample line")]
    Empty,

    #[error("Invalid label '{label}'")]
    InvalidLabel { label: String },

    #[error("Invalid feature '{feature}': {message}")]
    InvalidFeature { feature: String, message: String },

    #[error("Sample has no label; it can be predicted on but not learned from")]
    MissingLabel,
}

/// Result type alias for OnlineTune operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Helper trait for converting string errors
pub trait IntoTuneError {
    fn into_tune_error(self) -> TuneError;
}

impl IntoTuneError for String {
    fn into_tune_error(self) -> TuneError {
        TuneError::Internal(self)
    }
}

impl IntoTuneError for &str {
    fn into_tune_error(self) -> TuneError {
        TuneError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config($crate::ConfigError::Invalid {
            message: format!($($arg)*),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::UnknownPolicy {
            kind: "score".to_string(),
            name: "median".to_string(),
        };

        assert!(error.to_string().contains("Unknown score policy"));
        assert!(error.to_string().contains("median"));
    }

    #[test]
    fn test_error_conversion() {
        let learner_error = LearnerError::BuildFailed {
            message: "test".to_string(),
        };
        let tune_error: TuneError = learner_error.into();

        match tune_error {
            TuneError::Learner(_) => (),
            _ => panic!("Expected Learner error"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, TuneError::Validation(_)));
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, TuneError::Internal(_)));
        let config_err = config_error!("Missing required field: {}", "interactions");
        assert!(config_err.to_string().contains("interactions"));
    }

    #[test]
    fn test_into_tune_error() {
        let err = "boom".into_tune_error();
        assert_eq!(err.to_string(), "Internal error: boom");
    }
}
