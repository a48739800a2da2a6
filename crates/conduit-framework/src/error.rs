//! Error types for the Conduit framework.

use thiserror::Error;

use conduit_core::BusError;

/// Errors that can occur while extracting handler arguments.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The params could not be deserialized into the requested type.
    #[error("params do not match '{expected}': {reason}")]
    Params {
        /// Requested type name.
        expected: &'static str,
        /// Deserializer message.
        reason: String,
    },

    /// The handler asked for a continuation but it is the last one.
    #[error("no next handler")]
    NoNext,

    /// Custom extraction error.
    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

impl From<ExtractError> for BusError {
    fn from(err: ExtractError) -> Self {
        BusError::Extract(err.to_string())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;
