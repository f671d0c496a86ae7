//! Error types for the Floodgate service.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Prefix a configuration error with where it came from.
    pub(crate) fn in_context(self, context: &str) -> Self {
        match self {
            FloodgateError::Config(msg) => FloodgateError::Config(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Why a request could not be mapped to an admission key.
///
/// Never fatal for the request: the adapters allow it through and log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyResolutionError {
    /// No authenticated identity is attached to the request.
    #[error("rate limiting requires an authenticated user")]
    MissingIdentity,

    /// An identity was present but unusable.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Neither a forwarded header nor a transport address was available.
    #[error("client address unavailable")]
    MissingClientAddress,
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_prefixes_config_message_once() {
        let err = FloodgateError::Config("bucket capacity must be greater than zero".to_string())
            .in_context("policy 'checkout'");
        assert_eq!(
            err.to_string(),
            "Configuration error: policy 'checkout': bucket capacity must be greater than zero"
        );
    }

    #[test]
    fn test_context_leaves_io_errors_alone() {
        let err = FloodgateError::Io(std::io::Error::other("disk gone")).in_context("policies");
        assert!(matches!(err, FloodgateError::Io(_)));
    }
}
