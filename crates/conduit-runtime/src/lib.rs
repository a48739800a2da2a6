//! Conduit Runtime - wiring for the Conduit message bus.
//!
//! This crate provides:
//! - Layered configuration loading ([`ConfigLoader`])
//! - Logging setup on `tracing-subscriber` ([`LoggingBuilder`])
//! - [`ServiceBus`], which serves a `Bus` over a `MessageBus`
//! - [`ConduitRuntime`], which builds all of the above from configuration
//!
//! ```rust,ignore
//! use conduit_runtime::ConduitRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ConduitRuntime::builder().profile("production").build()?;
//!     runtime.bus().subscribe("math.add", add)?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod service;

pub use config::{ConduitConfig, ConfigError, ConfigLoader, ConfigResult, LoggingConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::LoggingBuilder;
pub use runtime::{ConduitRuntime, RuntimeBuilder};
pub use service::{Extracted, ServiceBus};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
