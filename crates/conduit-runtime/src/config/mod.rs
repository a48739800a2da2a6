//! Configuration for the Conduit runtime.
//!
//! Settings are layered with figment: built-in defaults, then programmatic
//! merges, then configuration files, then `CONDUIT_` environment variables.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ENV_PREFIX, PROFILE_VAR, Profile, load_config, load_config_from_file};
pub use schema::{
    ConduitConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, ServiceConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
