//! Unified error types for the Conduit engine.
//!
//! Every failure that can reach a caller of `dispatch`, `publish` or `send`
//! is a [`BusError`]. The enum is `Clone` so the same value can be handed to
//! the caller and mirrored onto the error observability channel.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A boxed, thread-safe error, as produced by `?` on arbitrary error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised by a transport while moving frames.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The frame could not be handed to the transport.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// The transport has been shut down.
    #[error("transport closed: {reason}")]
    Closed {
        /// Reason for closure.
        reason: String,
    },

    /// No configured route accepts the topic.
    #[error("Unable to find matching route for topic \"{topic}\"")]
    NoRoute {
        /// The topic that could not be routed.
        topic: String,
    },

    /// The operation needs a transport but none is attached.
    #[error("transport '{transport}' not available")]
    NotAvailable {
        /// Name of the missing transport.
        transport: &'static str,
    },

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

// =============================================================================
// Handler Errors
// =============================================================================

/// A failure produced by a handler: a returned error, an error reply, or a
/// caught panic.
#[derive(Clone)]
pub struct HandlerError {
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Creates a handler error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a concrete error, keeping it reachable through `source()`.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    /// Wraps an already boxed error.
    pub fn from_boxed(err: BoxError) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Arc::from(err)),
        }
    }

    /// Builds an error out of a panic payload caught while running a handler.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("handler panicked: {detail}"))
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Wire Errors
// =============================================================================

/// Serializable form of a [`BusError`], carried in reply frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error kind, see [`BusError::kind`].
    pub kind: String,
    /// Display text of the original error.
    pub message: String,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// =============================================================================
// Bus Errors
// =============================================================================

/// Errors surfaced at the dispatch / send boundary.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Malformed or reserved topic string.
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The rejected input.
        topic: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A pattern matcher whose regular expression does not compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected expression.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// Nothing is subscribed to the topic.
    #[error("No handlers registered for the {topic} topic.")]
    NoHandlers {
        /// The topic that had no handlers.
        topic: String,
    },

    /// The active handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A handler tried to settle its result more than once.
    #[error("The result was already handled!")]
    DoubleSettlement,

    /// No correlated reply arrived in time.
    #[error("Waiting too long for message id's \"{id}\" reply!")]
    ReplyTimeout {
        /// Id of the message that was never answered.
        id: Uuid,
    },

    /// A handler argument could not be extracted from the context.
    #[error("failed to extract handler argument: {0}")]
    Extract(String),

    /// A remote handler failed; the original error crossed the wire.
    #[error("{0}")]
    Remote(WireError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BusError {
    /// Creates an invalid topic error.
    pub fn invalid_topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Creates a no-handlers error for the topic.
    pub fn no_handlers(topic: impl fmt::Display) -> Self {
        Self::NoHandlers {
            topic: topic.to_string(),
        }
    }

    /// Creates a handler error from a message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(HandlerError::new(message))
    }

    /// Converts a boxed error, unwrapping it when it already is a `BusError`.
    ///
    /// Errors bubbling up from a nested `dispatch` keep their variant instead
    /// of being flattened into [`BusError::Handler`].
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<BusError>() {
            Ok(bus) => *bus,
            Err(other) => Self::Handler(HandlerError::from_boxed(other)),
        }
    }

    /// Stable, machine readable kind of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTopic { .. } => "invalid_topic",
            Self::InvalidPattern { .. } => "invalid_pattern",
            Self::NoHandlers { .. } => "no_handlers",
            Self::Handler(_) => "handler",
            Self::DoubleSettlement => "double_settlement",
            Self::ReplyTimeout { .. } => "reply_timeout",
            Self::Extract(_) => "extract",
            Self::Remote(wire) => match wire.kind.as_str() {
                "invalid_topic" => "invalid_topic",
                "invalid_pattern" => "invalid_pattern",
                "no_handlers" => "no_handlers",
                "double_settlement" => "double_settlement",
                "reply_timeout" => "reply_timeout",
                "extract" => "extract",
                "transport" => "transport",
                _ => "handler",
            },
            Self::Transport(_) => "transport",
        }
    }

    /// Serializable form for reply frames.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Remote(wire) => wire.clone(),
            other => WireError {
                kind: other.kind().to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Returns `true` for errors raised because nothing was subscribed.
    pub fn is_no_handlers(&self) -> bool {
        self.kind() == "no_handlers"
    }
}

impl From<WireError> for BusError {
    fn from(wire: WireError) -> Self {
        Self::Remote(wire)
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// The settled outcome of a handler, cascade, or correlated send.
pub type Outcome = Result<Value, BusError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_no_handlers_message_names_topic() {
        let err = BusError::no_handlers("say.hello");
        assert_eq!(
            err.to_string(),
            "No handlers registered for the say.hello topic."
        );
    }

    #[test]
    fn test_from_boxed_keeps_bus_errors() {
        let boxed: BoxError = Box::new(BusError::no_handlers("a.b"));
        assert!(matches!(
            BusError::from_boxed(boxed),
            BusError::NoHandlers { topic } if topic == "a.b"
        ));
    }

    #[test]
    fn test_from_boxed_wraps_foreign_errors() {
        let boxed: BoxError = Box::new(DiskError);
        let err = BusError::from_boxed(boxed);
        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "disk on fire");

        let BusError::Handler(inner) = err else {
            panic!("expected handler error");
        };
        assert!(std::error::Error::source(&inner).is_some());
    }

    #[test]
    fn test_wire_round_trip_keeps_kind() {
        let err = BusError::ReplyTimeout { id: Uuid::nil() };
        let remote = BusError::from(err.to_wire());
        assert_eq!(remote.kind(), "reply_timeout");
        assert_eq!(remote.to_string(), err.to_string());
    }

    #[test]
    fn test_remote_kinds_survive_the_wire() {
        let local = [
            BusError::invalid_topic("a..b", "empty segment"),
            BusError::InvalidPattern {
                pattern: "(unclosed".to_string(),
                reason: "unclosed group".to_string(),
            },
            BusError::DoubleSettlement,
            BusError::handler("boom"),
        ];
        for err in local {
            assert_eq!(BusError::from(err.to_wire()).kind(), err.kind());
        }
    }

    #[test]
    fn test_panic_payloads() {
        let err = HandlerError::from_panic(Box::new("boom"));
        assert_eq!(err.message(), "handler panicked: boom");

        let err = HandlerError::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.message(), "handler panicked: bang");

        let err = HandlerError::from_panic(Box::new(42_u8));
        assert_eq!(err.message(), "handler panicked: non-string panic payload");
    }
}
