use thiserror::Error;

/// Main error type for the Crema system
#[derive(Error, Debug)]
pub enum CremaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Safety rejection: {reason}")]
    SafetyRejection { reason: String },

    #[error("Hardware fault: {message}")]
    Hardware { message: String },

    #[error("Trial timed out after {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    #[error("Model fit failed: {message}")]
    ModelFit { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CremaError {
    /// Errors the optimization loop recovers from locally by proposing again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CremaError::Validation(_) | CremaError::SafetyRejection { .. }
        )
    }
}

/// Result type alias for Crema operations
pub type CremaResult<T> = Result<T, CremaError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CremaError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CremaError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CremaError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CremaError::Timeout {
            timeout_seconds: 120,
        };
        assert!(error.to_string().contains("timed out"));
        assert!(error.to_string().contains("120"));
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: CremaError = json_err.into();
        match err {
            CremaError::Serialization(_) => (),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(validation_error!("dose {} out of range", 30.0).is_recoverable());
        assert!(CremaError::SafetyRejection {
            reason: "flagged".into()
        }
        .is_recoverable());
        assert!(!CremaError::Persistence {
            message: "disk full".into()
        }
        .is_recoverable());
        assert!(!internal_error!("boom").is_recoverable());
        assert!(!config_error!("missing {}", "max_trials").is_recoverable());
    }
}
