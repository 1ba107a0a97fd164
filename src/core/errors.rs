// Error types for the recognition / translation core
//
// Using thiserror so callers can match on the failure kind and still get
// a readable Display for logs.

use thiserror::Error;

/// How a failure should be presented to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The user has to fix their input (bad key, full pool, ...)
    Configuration,
    /// The provider or storage hiccuped, trying again may work
    Transient,
    /// Superseded or stopped work, nothing to show
    Silent,
}

/// Errors surfaced by the orchestration core
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("API key does not match the expected format ({expected})")]
    InvalidFormat { expected: &'static str },

    #[error("Credential pool is full ({capacity} keys max)")]
    CapacityExceeded { capacity: usize },

    #[error("This API key is already in the pool")]
    Duplicate,

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Provider request failed: {message}")]
    ProviderFailure { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to persist {key}: {reason}")]
    PersistenceFailure { key: String, reason: String },

    #[error("On-device recognition failed: {0}")]
    OnDeviceFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl CoreError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderFailure {
            message: message.into(),
        }
    }

    pub fn persistence(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::PersistenceFailure {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::InvalidFormat { .. }
            | CoreError::CapacityExceeded { .. }
            | CoreError::Duplicate
            | CoreError::NotFound { .. }
            | CoreError::InvalidConfiguration(_) => ErrorClass::Configuration,
            CoreError::ProviderFailure { .. }
            | CoreError::PersistenceFailure { .. }
            | CoreError::OnDeviceFailure(_) => ErrorClass::Transient,
            CoreError::Cancelled => ErrorClass::Silent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Short message for the presentation layer. Cancellation has none.
    pub fn user_message(&self) -> Option<String> {
        let message = match self {
            CoreError::InvalidFormat { .. } => {
                "That doesn't look like a valid API key. Check it and try again.".to_string()
            }
            CoreError::CapacityExceeded { capacity } => {
                format!("You can store at most {} API keys. Remove one first.", capacity)
            }
            CoreError::Duplicate => "This API key has already been added.".to_string(),
            CoreError::NotFound { what, .. } => format!("The {} no longer exists.", what),
            CoreError::InvalidConfiguration(reason) => format!("Invalid setting: {}", reason),
            CoreError::ProviderFailure { message } => {
                format!("Cloud service error, please try again. ({})", message)
            }
            CoreError::PersistenceFailure { .. } => {
                "Couldn't save your settings, please try again.".to_string()
            }
            CoreError::OnDeviceFailure(_) => {
                "Text recognition failed on this image, please try again.".to_string()
            }
            CoreError::Cancelled => return None,
        };
        Some(message)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("Cloud threshold must be in [0, 100], got {0}")]
    InvalidCloudThreshold(u8),

    #[error("Pool capacity must be > 0, got {0}")]
    InvalidPoolCapacity(usize),

    #[error("Failure threshold must be > 0, got {0}")]
    InvalidFailureThreshold(u32),

    #[error("Quality bands must be descending within [0.0, 1.0]: {0}")]
    InvalidQualityBands(String),

    #[error("Invalid recognition config: {0}")]
    InvalidRecognitionConfig(String),

    #[error("Invalid cache config: {0}")]
    InvalidCacheConfig(String),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(CoreError::Duplicate.class(), ErrorClass::Configuration);
        assert_eq!(
            CoreError::CapacityExceeded { capacity: 5 }.class(),
            ErrorClass::Configuration
        );
        assert_eq!(CoreError::provider("503").class(), ErrorClass::Transient);
        assert_eq!(
            CoreError::persistence("model", "disk full").class(),
            ErrorClass::Transient
        );
        assert_eq!(CoreError::Cancelled.class(), ErrorClass::Silent);
    }

    #[test]
    fn test_cancelled_has_no_user_message() {
        assert!(CoreError::Cancelled.user_message().is_none());
        assert!(CoreError::Duplicate.user_message().is_some());

        let msg = CoreError::provider("quota exceeded").user_message().unwrap();
        assert!(msg.contains("try again"));
        assert!(msg.contains("quota exceeded"));
    }
}
