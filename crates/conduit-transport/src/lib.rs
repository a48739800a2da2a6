//! # Conduit Transport
//!
//! Concrete transports and request/reply correlation for the Conduit
//! message bus.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`LoopbackTransport`] | Delivers frames back to the same process |
//! | [`ChannelTransport`] | One end of an in-memory duplex link between two buses |
//! | [`TransportRouter`] | Picks a transport per topic, newest route first |
//! | [`MessageBus`] | Sends messages and matches replies by message id |
//!
//! ```rust,ignore
//! let messages = MessageBus::loopback();
//! let _handle = messages.on_message(Arc::new(|message| println!("{}", message.topic)));
//!
//! let reply = messages
//!     .send(Message::new(TopicKey::parse("math.add")?, json!([1, 2])))
//!     .await?;
//! ```

pub mod channel;
pub mod correlation;
pub mod loopback;
pub mod router;

pub use channel::ChannelTransport;
pub use correlation::MessageBus;
pub use loopback::LoopbackTransport;
pub use router::{Route, TransportRouter};

use conduit_core::{Frame, ListenerSet, Message, Reply, TransportResult};

/// Decodes `bytes` and fans the frame out to the matching listener set.
pub(crate) fn deliver(
    bytes: &[u8],
    messages: &ListenerSet<Message>,
    replies: &ListenerSet<Reply>,
) -> TransportResult<()> {
    match Frame::decode(bytes)? {
        Frame::Message(message) => {
            messages.emit(&message);
        }
        Frame::Reply(reply) => {
            replies.emit(&reply);
        }
    }
    Ok(())
}
