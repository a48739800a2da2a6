//! Request/reply correlation over routed transports.
//!
//! [`MessageBus::send`] tags nothing: the message id already is the
//! correlation key. A pending entry keyed by that id is registered before the
//! message is handed to the transport, so a reply can never arrive ahead of
//! its waiter. Replies that match no pending entry (unknown ids, or ids that
//! already timed out) are logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use conduit_core::{
    BoxedTransport, BusError, BusResult, CorrelationConfig, Listener, ListenerHandle, ListenerSet,
    Message, MessageSender, Outcome, Regex, Reply, TransportError,
};

use crate::router::{Route, TransportRouter};

type Pending = Mutex<HashMap<Uuid, oneshot::Sender<Reply>>>;

/// Removes a pending entry when the waiting send ends, however it ends.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: Uuid,
}

impl<'a> PendingEntry<'a> {
    fn register(pending: &'a Pending, id: Uuid) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);
        (Self { pending, id }, rx)
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.id).is_some() {
            trace!(id = %self.id, "Stopped waiting for reply");
        }
    }
}

struct Attachment {
    transport: BoxedTransport,
    _listeners: ListenerHandle,
}

struct Inner {
    router: TransportRouter,
    pending: Pending,
    messages: ListenerSet<Message>,
    attached: Mutex<Vec<Attachment>>,
    reply_timeout: Duration,
}

impl Inner {
    fn resolve(&self, reply: Reply) {
        let id = reply.id;
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                trace!(id = %id, "Reply matched");
                if tx.send(reply).is_err() {
                    debug!(id = %id, "Reply arrived after its sender stopped waiting");
                }
            }
            None => debug!(id = %id, "Dropping reply for unknown message id"),
        }
    }
}

/// Sends messages over routed transports and matches their replies.
///
/// Cloning is cheap; clones share the pending map and the routes.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new(router: TransportRouter, config: &CorrelationConfig) -> Self {
        let inner = Arc::new(Inner {
            router,
            pending: Mutex::new(HashMap::new()),
            messages: ListenerSet::new(),
            attached: Mutex::new(Vec::new()),
            reply_timeout: config.reply_timeout(),
        });
        for transport in inner.router.transports() {
            attach(&inner, transport);
        }
        Self { inner }
    }

    /// A message bus looping every topic back into this process.
    pub fn loopback() -> Self {
        Self::new(TransportRouter::loopback(), &CorrelationConfig::default())
    }

    /// Routes topics matching `pattern` to `transport`, ahead of older routes.
    pub fn add_route(&self, pattern: Regex, transport: BoxedTransport) {
        attach(&self.inner, Arc::clone(&transport));
        self.inner.router.add_route(pattern, transport);
    }

    /// Current routes, newest first. Add routes with [`MessageBus::add_route`]
    /// so their replies are listened to.
    pub fn routes(&self) -> Vec<Route> {
        self.inner.router.routes()
    }

    pub fn transports(&self) -> Vec<BoxedTransport> {
        self.inner.router.transports()
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout
    }

    /// Sends `message`.
    ///
    /// Acknowledging messages resolve with the correlated reply or fail with
    /// [`BusError::ReplyTimeout`]; others resolve with `null` once the
    /// transport accepted them.
    pub async fn send(&self, message: Message) -> BusResult<Value> {
        let transport = self.inner.router.route(&message.topic)?;
        debug!(
            topic = %message.topic,
            id = %message.id,
            acknowledge = message.acknowledge,
            transport = %transport.name(),
            "Sending message"
        );

        if !message.acknowledge {
            transport.send_message(&message).await?;
            return Ok(Value::Null);
        }

        // Dropping `_entry` clears the waiter on every exit path, including
        // the caller abandoning this future.
        let (_entry, rx) = PendingEntry::register(&self.inner.pending, message.id);
        transport.send_message(&message).await?;

        match timeout(self.inner.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_outcome(),
            Ok(Err(_)) => Err(TransportError::Closed {
                reason: "message bus closed while waiting for a reply".to_string(),
            }
            .into()),
            Err(_) => {
                warn!(topic = %message.topic, id = %message.id, "Reply timed out");
                Err(BusError::ReplyTimeout { id: message.id })
            }
        }
    }

    /// Sends `message` without waiting for a reply.
    pub async fn publish(&self, mut message: Message) -> BusResult<()> {
        message.acknowledge = false;
        self.send(message).await.map(|_| ())
    }

    /// Answers `message` on the route of its topic.
    pub async fn reply(&self, message: &Message, outcome: &Outcome) -> BusResult<()> {
        let transport = self.inner.router.route(&message.topic)?;
        trace!(id = %message.id, ok = outcome.is_ok(), "Sending reply");
        transport
            .send_reply(&Reply::from_outcome(message.id, outcome))
            .await?;
        Ok(())
    }

    /// Listens for inbound messages from every routed transport.
    pub fn on_message(&self, listener: Listener<Message>) -> ListenerHandle {
        self.inner.messages.add(listener)
    }

    /// Number of sends still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Fails every pending send with [`TransportError::Closed`].
    pub fn close(&self) {
        let mut pending = self.inner.pending.lock();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Clearing pending replies");
            pending.clear();
        }
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("router", &self.inner.router)
            .field("pending", &self.pending_count())
            .field("reply_timeout", &self.inner.reply_timeout)
            .finish()
    }
}

#[async_trait]
impl MessageSender for MessageBus {
    async fn send(&self, message: Message) -> BusResult<Value> {
        MessageBus::send(self, message).await
    }

    async fn publish(&self, message: Message) -> BusResult<()> {
        MessageBus::publish(self, message).await
    }
}

fn attach(inner: &Arc<Inner>, transport: BoxedTransport) {
    let mut attached = inner.attached.lock();
    if attached
        .iter()
        .any(|a| Arc::ptr_eq(&a.transport, &transport))
    {
        return;
    }

    let weak = Arc::downgrade(inner);
    let replies = transport.on_reply(Arc::new(move |reply: &Reply| {
        if let Some(inner) = weak.upgrade() {
            inner.resolve(reply.clone());
        }
    }));
    let weak = Arc::downgrade(inner);
    let messages = transport.on_message(Arc::new(move |message: &Message| {
        if let Some(inner) = weak.upgrade() {
            inner.messages.emit(message);
        }
    }));

    debug!(transport = %transport.name(), "Transport attached");
    attached.push(Attachment {
        transport,
        _listeners: ListenerHandle::merge(vec![replies, messages]),
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio_test::assert_ok;

    use super::*;
    use crate::channel::ChannelTransport;
    use crate::loopback::LoopbackTransport;
    use conduit_core::{TopicKey, Transport};

    fn message(topic: &str, payload: Value) -> Message {
        Message::new(TopicKey::parse(topic).unwrap(), payload)
    }

    /// A loopback message bus whose inbound messages are answered by `answer`.
    fn answering(
        answer: impl Fn(&Message) -> Reply + Send + Sync + 'static,
    ) -> (MessageBus, ListenerHandle) {
        let transport = Arc::new(LoopbackTransport::new());
        let router = TransportRouter::new();
        router.add_route(Regex::new(".*").unwrap(), transport.clone());
        let bus = MessageBus::new(router, &CorrelationConfig::default());

        let handle = bus.on_message(Arc::new(move |message: &Message| {
            let reply = answer(message);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send_reply(&reply).await });
        }));
        (bus, handle)
    }

    #[tokio::test]
    async fn test_reply_resolves_send() {
        let (bus, _answer) = answering(|m| Reply::ok(m.id, json!(format!("echo {}", m.payload))));

        let result = bus.send(message("echo", json!(1))).await.unwrap();
        assert_eq!(result, json!("echo 1"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_rejects_send() {
        let (bus, _answer) = answering(|m| Reply::err(m.id, &BusError::handler("nope")));

        let err = bus.send(message("echo", Value::Null)).await.unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn test_missing_result_is_null() {
        let (bus, _answer) = answering(|m| Reply {
            id: m.id,
            result: None,
            error: None,
        });
        assert_eq!(bus.send(message("echo", json!(1))).await.unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_send_times_out() {
        let bus = MessageBus::loopback();
        let outgoing = message("silent", Value::Null);
        let id = outgoing.id;

        let err = bus.send(outgoing.clone()).await.unwrap_err();
        assert!(matches!(err, BusError::ReplyTimeout { id: timed_out } if timed_out == id));
        assert_eq!(
            err.to_string(),
            format!("Waiting too long for message id's \"{id}\" reply!")
        );
        assert_eq!(bus.pending_count(), 0);

        // A late reply finds nothing to resolve.
        assert_ok!(bus.reply(&outgoing, &Ok(json!("late"))).await);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_send_clears_pending() {
        let bus = MessageBus::loopback();

        let abandoned = timeout(
            Duration::from_millis(10),
            bus.send(message("silent", Value::Null)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(bus.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_added_routes_are_answered() {
        let bus = MessageBus::new(TransportRouter::new(), &CorrelationConfig::default());
        let transport = Arc::new(LoopbackTransport::new());
        bus.add_route(Regex::new(".*").unwrap(), transport.clone());
        let _answer = bus.on_message(Arc::new(move |m: &Message| {
            let reply = Reply::ok(m.id, json!("pong"));
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send_reply(&reply).await });
        }));

        assert_eq!(bus.routes().len(), 1);
        assert_eq!(bus.transports()[0].name(), "loopback");
        assert_eq!(bus.send(message("ping", Value::Null)).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_publish_does_not_wait() {
        let bus = MessageBus::loopback();
        let (tx, mut rx) = unbounded_channel();
        let _inbound = bus.on_message(Arc::new(move |m: &Message| {
            let _ = tx.send(m.acknowledge);
        }));

        bus.publish(message("fire", Value::Null)).await.unwrap();
        assert_eq!(
            bus.send(message("fire", Value::Null).without_ack())
                .await
                .unwrap(),
            Value::Null
        );

        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unrouted_topic() {
        let bus = MessageBus::new(TransportRouter::new(), &CorrelationConfig::default());
        let err = bus.send(message("nowhere", Value::Null)).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Transport(TransportError::NoRoute { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_sends() {
        let bus = MessageBus::loopback();
        let waiting = tokio::spawn({
            let bus = bus.clone();
            async move { bus.send(message("silent", Value::Null)).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.close();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Transport(TransportError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_two_buses_over_a_channel() {
        let (left, right) = ChannelTransport::pair();
        let client = MessageBus::new(TransportRouter::new(), &CorrelationConfig::default());
        client.add_route(Regex::new(".*").unwrap(), Arc::new(left));
        let server = MessageBus::new(TransportRouter::new(), &CorrelationConfig::default());
        server.add_route(Regex::new(".*").unwrap(), Arc::new(right));

        let (tx, mut rx) = unbounded_channel();
        let _inbound = server.on_message(Arc::new(move |m: &Message| {
            let _ = tx.send(m.clone());
        }));
        let serving = tokio::spawn({
            let server = server.clone();
            async move {
                while let Some(request) = rx.recv().await {
                    let sum = request.payload.as_array().map_or(0, |items| {
                        items.iter().filter_map(Value::as_i64).sum::<i64>()
                    });
                    server.reply(&request, &Ok(json!(sum))).await.unwrap();
                }
            }
        });

        let result = client.send(message("math.add", json!([1, 2, 3]))).await;
        assert_eq!(result.unwrap(), json!(6));

        serving.abort();
    }
}
