//! Transport abstraction and wire frames.
//!
//! A transport moves [`Message`]s and [`Reply`]s between buses. It knows
//! nothing about correlation or timeouts; that lives one layer up in the
//! message bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BusResult, TransportResult};
use crate::listener::{Listener, ListenerHandle};
use crate::message::{Message, Reply};

// =============================================================================
// Frames
// =============================================================================

/// Everything that crosses a byte-oriented transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Message(Message),
    Reply(Reply),
}

impl Frame {
    /// Encodes the frame as JSON.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a JSON frame.
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A carrier for messages and replies.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Emits an outbound message.
    async fn send_message(&self, message: &Message) -> TransportResult<()>;

    /// Emits a reply.
    async fn send_reply(&self, reply: &Reply) -> TransportResult<()>;

    /// Subscribes to inbound messages.
    fn on_message(&self, listener: Listener<Message>) -> ListenerHandle;

    /// Subscribes to inbound replies.
    fn on_reply(&self, listener: Listener<Reply>) -> ListenerHandle;
}

/// Type-erased transport.
pub type BoxedTransport = Arc<dyn Transport>;

// =============================================================================
// MessageSender
// =============================================================================

/// Outbound side of a message bus as seen from a handler.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends a message; acknowledging messages wait for the reply.
    async fn send(&self, message: Message) -> BusResult<Value>;

    /// Sends a message without waiting for a reply.
    async fn publish(&self, message: Message) -> BusResult<()>;
}

/// Type-erased sender.
pub type BoxedSender = Arc<dyn MessageSender>;
