//! In-memory duplex transport between two buses.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use conduit_core::{
    Frame, Listener, ListenerHandle, ListenerSet, Message, Reply, Transport, TransportError,
    TransportResult,
};

use crate::deliver;

/// Frames buffered per direction before senders wait.
pub const DEFAULT_CAPACITY: usize = 64;

/// One end of a connected pair.
///
/// Frames written on one end are encoded, carried over a tokio channel and
/// emitted to the listeners of the other end by a pump task. Closing either
/// end stops both pumps.
pub struct ChannelTransport {
    name: String,
    outbound: mpsc::Sender<Vec<u8>>,
    messages: ListenerSet<Message>,
    replies: ListenerSet<Reply>,
    shutdown: CancellationToken,
}

impl ChannelTransport {
    /// Creates two connected ends. Must be called inside a tokio runtime.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let shutdown = CancellationToken::new();
        let (left_tx, left_rx) = mpsc::channel(capacity);
        let (right_tx, right_rx) = mpsc::channel(capacity);

        let left = Self::spawn("channel:left", right_tx, left_rx, shutdown.clone());
        let right = Self::spawn("channel:right", left_tx, right_rx, shutdown);
        (left, right)
    }

    fn spawn(
        name: &str,
        outbound: mpsc::Sender<Vec<u8>>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Self {
        let messages = ListenerSet::new();
        let replies = ListenerSet::new();

        let pump_name = name.to_string();
        let pump_messages = messages.clone();
        let pump_replies = replies.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    bytes = inbound.recv() => {
                        let Some(bytes) = bytes else { break };
                        trace!(transport = %pump_name, bytes = bytes.len(), "Frame received");
                        if let Err(e) = deliver(&bytes, &pump_messages, &pump_replies) {
                            warn!(transport = %pump_name, error = %e, "Dropping undecodable frame");
                        }
                    }
                }
            }
            debug!(transport = %pump_name, "Channel pump stopped");
        });

        Self {
            name: name.to_string(),
            outbound,
            messages,
            replies,
            shutdown,
        }
    }

    /// Stops both ends of the pair.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    async fn write(&self, frame: Frame) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed {
                reason: format!("{} was closed", self.name),
            });
        }
        let bytes = frame.encode()?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, message: &Message) -> TransportResult<()> {
        self.write(Frame::Message(message.clone())).await
    }

    async fn send_reply(&self, reply: &Reply) -> TransportResult<()> {
        self.write(Frame::Reply(reply.clone())).await
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

    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio_test::assert_err;

    use super::*;
    use conduit_core::TopicKey;

    #[tokio::test]
    async fn test_frames_cross_the_pair() {
        let (left, right) = ChannelTransport::pair();
        let (tx, mut rx) = unbounded_channel();
        let (echo_tx, mut echo_rx) = unbounded_channel();

        let _on_right = right.on_message(Arc::new(move |message: &Message| {
            let _ = tx.send(message.clone());
        }));
        let _on_left = left.on_message(Arc::new(move |message: &Message| {
            let _ = echo_tx.send(message.clone());
        }));

        let message = Message::new(TopicKey::parse("math.add").unwrap(), json!([1, 2]));
        left.send_message(&message).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), message);
        assert!(echo_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replies_flow_back() {
        let (left, right) = ChannelTransport::pair();
        let (tx, mut rx) = unbounded_channel();
        let _on_left = left.on_reply(Arc::new(move |reply: &Reply| {
            let _ = tx.send(reply.clone());
        }));

        let reply = Reply::ok(uuid::Uuid::new_v4(), json!("done"));
        right.send_reply(&reply).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_closed_pair_rejects_frames() {
        let (left, right) = ChannelTransport::pair();
        right.close();

        assert!(left.is_closed());
        let message = Message::new(TopicKey::parse("ping").unwrap(), json!(null));
        let err = assert_err!(left.send_message(&message).await);
        assert!(matches!(err, TransportError::Closed { .. }));
    }
}
