//! # Conduit
//!
//! A topic-routed message bus with cascading handlers and request/reply
//! transports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌─────────────────────────────────┐
//! │  ServiceBus  │────▶│     Bus      │────▶│ handler (priority 100) ──next──▶ │
//! │  (namespace) │     │  (registry)  │     │ handler (priority 10)  ──next──▶ │
//! └──────┬───────┘     └──────────────┘     │ handler (priority 0)            │
//!        │                                  └─────────────────────────────────┘
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │  MessageBus  │────▶│  Transport   │  loopback / channel / custom
//! │ (correlation)│◀────│   (router)   │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! - **Bus**: Registers handlers on exact topics or regex patterns and runs
//!   them as a priority-ordered cascade that settles exactly once
//! - **MessageBus**: Sends messages over routed transports and pairs replies
//!   with their requests under a timeout
//! - **ServiceBus**: Serves a bus over a message bus below a namespace
//! - **Runtime**: Builds all of the above from layered configuration
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conduit::prelude::*;
//!
//! async fn add(Params(items): Params<Vec<i64>>) -> i64 {
//!     items.iter().sum()
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ConduitRuntime::builder().build()?;
//!     runtime.bus().subscribe("math.add", add)?;
//!
//!     let sum = runtime.bus().dispatch("math.add", json!([1, 2, 3])).await?;
//!     info!(%sum, "Computed");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: Load `conduit.toml` files (default)
//! - `yaml-config`: Load `conduit.yaml` files
//! - `json-log`: Enable the JSON log format

pub use conduit_core as core;
pub use conduit_framework as framework;
pub use conduit_runtime as runtime;
pub use conduit_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use conduit::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use conduit_runtime::{ConduitRuntime, ServiceBus};

    // Bus and handlers
    pub use conduit_framework::{
        Bus, Context, DefaultParamsLayer, Json, Next, Params, Payload, Responder, ValidateLayer,
    };

    // Messages and errors
    pub use conduit_core::{
        BusError, BusResult, Event, HandlerError, Matcher, Message, Regex, TopicKey,
    };

    // Transports
    pub use conduit_transport::{ChannelTransport, MessageBus, TransportRouter};

    pub use conduit_runtime::prelude::*;
    pub use serde_json::{Value, json};
}
