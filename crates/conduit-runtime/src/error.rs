//! Runtime error types.

use thiserror::Error;

use conduit_core::BusError;

use crate::config::ConfigError;

/// Errors that can occur while building or running a runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus rejected part of the wiring, e.g. an invalid namespace.
    #[error("Bus setup failed: {0}")]
    Bus(#[from] BusError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
