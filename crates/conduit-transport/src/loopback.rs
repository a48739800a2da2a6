//! In-process transport.

use async_trait::async_trait;
use tracing::trace;

use conduit_core::{
    Frame, Listener, ListenerHandle, ListenerSet, Message, Reply, Transport, TransportResult,
};

use crate::deliver;

/// Delivers every frame back to its own listeners.
///
/// Frames still go through the JSON codec, so anything that would not
/// survive a real wire fails here too. Delivery is synchronous: listeners
/// have run by the time `send_message` returns.
#[derive(Debug, Default, Clone)]
pub struct LoopbackTransport {
    messages: ListenerSet<Message>,
    replies: ListenerSet<Reply>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn loop_back(&self, frame: Frame) -> TransportResult<()> {
        let bytes = frame.encode()?;
        trace!(bytes = bytes.len(), "Looping frame back");
        deliver(&bytes, &self.messages, &self.replies)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn send_message(&self, message: &Message) -> TransportResult<()> {
        self.loop_back(Frame::Message(message.clone()))
    }

    async fn send_reply(&self, reply: &Reply) -> TransportResult<()> {
        self.loop_back(Frame::Reply(reply.clone()))
    }

    fn on_message(&self, listener: Listener<Message>) -> ListenerHandle {
        self.messages.add(listener)
    }

    fn on_reply(&self, listener: Listener<Reply>) -> ListenerHandle {
        self.replies.add(listener)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use conduit_core::{BusError, TopicKey};

    #[tokio::test]
    async fn test_frames_come_back() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _messages = transport.on_message(Arc::new(move |message: &Message| {
            sink.lock().push(format!("message {}", message.topic));
        }));
        let sink = Arc::clone(&seen);
        let _replies = transport.on_reply(Arc::new(move |reply: &Reply| {
            sink.lock().push(format!("reply {}", reply.error.is_some()));
        }));

        let message = Message::new(TopicKey::parse("math.add").unwrap(), json!([1, 2]));
        transport.send_message(&message).await.unwrap();
        transport
            .send_reply(&Reply::err(message.id, &BusError::handler("bad")))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), ["message math.add", "reply true"]);
    }

    #[tokio::test]
    async fn test_detached_listener_is_silent() {
        let transport = LoopbackTransport::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let handle = transport.on_message(Arc::new(move |_: &Message| *counter.lock() += 1));

        let message = Message::new(TopicKey::parse("ping").unwrap(), json!(null));
        transport.send_message(&message).await.unwrap();
        handle.detach();
        transport.send_message(&message).await.unwrap();

        assert_eq!(*count.lock(), 1);
    }
}
