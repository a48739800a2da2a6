//! # Conduit Core
//!
//! Engine level building blocks of the Conduit message bus.
//!
//! - **Topics**: validated keys and [`Matcher`]s ([`TopicKey`], [`IntoMatcher`])
//! - **Registry**: priority ordered handler registrations ([`TopicRegistry`])
//! - **Identity**: transport [`Message`]s and in-process [`Event`] lineage
//! - **Settlement**: the at-most-once result gate ([`Settlement`])
//! - **Transport**: the [`Transport`] trait and JSON [`Frame`]s
//! - **Errors**: [`BusError`] and friends
//!
//! Handler execution, the cascade and the `Bus` facade live in
//! `conduit-framework`; concrete transports and reply correlation live in
//! `conduit-transport`.
//!
//! ```text
//! subscribe ──▶ TopicRegistry ──resolve──▶ [Registration; N] ──▶ cascade
//!                                                          │
//! send ──▶ Message ──Frame──▶ Transport ──▶ peer ──▶ Reply ┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod message;
pub mod registry;
pub mod settlement;
pub mod topic;
pub mod transport;

pub use config::{BusConfig, CorrelationConfig, DEFAULT_REPLY_TIMEOUT};
pub use error::{
    BoxError, BusError, BusResult, HandlerError, Outcome, TransportError, TransportResult,
    WireError,
};
pub use event::{Ancestors, Event, EventOverrides, SelfCall};
pub use listener::{Listener, ListenerHandle, ListenerSet};
pub use message::{Message, MessageOverrides, Reply, now_millis};
pub use registry::{DEFAULT_PRIORITY, Meta, Registration, RegistrationId, TopicRegistry};
pub use settlement::{Settlement, SettlementReceiver, SettlementState};
pub use topic::{DEFAULT_DELIMITER, IntoMatcher, Matcher, RESERVED_TOPICS, TopicKey};
pub use transport::{BoxedSender, BoxedTransport, Frame, MessageSender, Transport};

/// Boxed `Send` future, as used by handler and transport signatures.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Re-exported so downstream crates can build pattern matchers.
pub use regex::Regex;
