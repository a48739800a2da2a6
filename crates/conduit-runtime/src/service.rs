//! Serving a [`Bus`] over a [`MessageBus`].
//!
//! ```text
//!  inbound Message ──strip namespace──▶ Bus::dispatch_request ──▶ Reply (ack)
//!                                                │                  └▶ error channel (no ack)
//!  ServiceBus::send ──routes / namespace──▶ MessageBus::send ──▶ transport
//! ```
//!
//! Handlers reached through a service bus can call `ctx.send` and
//! `ctx.publish`; those go back out through the same service bus, so
//! outbound routes and the namespace apply to them as well.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{Instrument, debug, debug_span, trace, warn};

use conduit_core::{
    BoxedSender, BusError, BusResult, ListenerHandle, Matcher, Message, MessageSender, Regex,
    TopicKey,
};
use conduit_framework::{Bus, DispatchRequest};
use conduit_transport::MessageBus;

type Rewrite = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Rewrites outbound messages whose topic matches `pattern`.
#[derive(Clone)]
struct OutboundRoute {
    pattern: Regex,
    rewrite: Rewrite,
}

struct ServiceInner {
    bus: Bus,
    message_bus: MessageBus,
    namespace: Option<TopicKey>,
    routes: RwLock<Vec<OutboundRoute>>,
    connection: Mutex<Option<ListenerHandle>>,
}

/// A bus served over a message bus under an optional namespace.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct ServiceBus {
    inner: Arc<ServiceInner>,
}

impl ServiceBus {
    /// Creates a service bus without listening for inbound messages yet.
    ///
    /// An empty `namespace` disables prefixing.
    pub fn new(bus: Bus, message_bus: MessageBus, namespace: &str) -> BusResult<Self> {
        let namespace = match namespace.trim() {
            "" => None,
            ns => Some(TopicKey::parse_with(ns, bus.delimiter())?),
        };
        Ok(Self {
            inner: Arc::new(ServiceInner {
                bus,
                message_bus,
                namespace,
                routes: RwLock::new(Vec::new()),
                connection: Mutex::new(None),
            }),
        })
    }

    /// Creates a service bus and starts serving inbound messages.
    pub fn connect(bus: Bus, message_bus: MessageBus, namespace: &str) -> BusResult<Self> {
        let service = Self::new(bus, message_bus, namespace)?;
        service.attach();
        Ok(service)
    }

    /// Starts serving inbound messages. Does nothing when already connected.
    pub fn attach(&self) {
        let mut connection = self.inner.connection.lock();
        if connection.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = self
            .inner
            .message_bus
            .on_message(Arc::new(move |message: &Message| {
                spawn_serve(&weak, message.clone());
            }));
        *connection = Some(handle);
        debug!(namespace = ?self.namespace(), "Service bus connected");
    }

    /// Stops serving inbound messages.
    pub fn disconnect(&self) {
        if let Some(handle) = self.inner.connection.lock().take() {
            handle.detach();
            debug!(namespace = ?self.namespace(), "Service bus disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.namespace.as_ref().map(TopicKey::as_str)
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.inner.message_bus
    }

    /// Rewrites outbound messages matching `pattern`, ahead of older routes.
    ///
    /// A routed message skips the local handler check and the namespace.
    pub fn add_route(
        &self,
        pattern: Regex,
        rewrite: impl Fn(Message) -> Message + Send + Sync + 'static,
    ) {
        self.inner.routes.write().insert(
            0,
            OutboundRoute {
                pattern,
                rewrite: Arc::new(rewrite),
            },
        );
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Sends `payload` to `topic` and waits for the reply.
    pub async fn send(&self, topic: &str, payload: Value) -> BusResult<Value> {
        self.send_message(Message::new(TopicKey::from_wire(topic)?, payload))
            .await
    }

    /// Sends `payload` to `topic` without waiting.
    pub async fn publish(&self, topic: &str, payload: Value) -> BusResult<()> {
        self.publish_message(Message::new(TopicKey::from_wire(topic)?, payload))
            .await
    }

    pub async fn send_message(&self, message: Message) -> BusResult<Value> {
        let message = self.inner.prepare(message, true)?;
        self.inner.message_bus.send(message).await
    }

    /// Publishing skips the local handler check.
    pub async fn publish_message(&self, message: Message) -> BusResult<()> {
        let message = self.inner.prepare(message, false)?;
        self.inner.message_bus.publish(message).await
    }

    /// Methods below `prefix`, called over the message bus.
    pub fn extract(&self, prefix: &str) -> BusResult<Extracted> {
        Ok(Extracted {
            service: self.clone(),
            prefix: TopicKey::parse_with(prefix, self.inner.bus.delimiter())?,
        })
    }
}

impl fmt::Debug for ServiceBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBus")
            .field("namespace", &self.namespace())
            .field("routes", &self.inner.routes.read().len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl MessageSender for ServiceBus {
    async fn send(&self, message: Message) -> BusResult<Value> {
        self.send_message(message).await
    }

    async fn publish(&self, message: Message) -> BusResult<()> {
        self.publish_message(message).await
    }
}

impl ServiceInner {
    /// Applies the first matching route, or checks local handlers and adds
    /// the namespace.
    fn prepare(&self, mut message: Message, check_local: bool) -> BusResult<Message> {
        let route = self
            .routes
            .read()
            .iter()
            .find(|route| route.pattern.is_match(message.topic.as_str()))
            .cloned();
        if let Some(route) = route {
            trace!(topic = %message.topic, pattern = %route.pattern, "Outbound route matched");
            return Ok((route.rewrite)(message));
        }

        if check_local && !self.bus.has_handlers(message.topic.as_str())? {
            return Err(BusError::no_handlers(&message.topic));
        }

        if let Some(namespace) = &self.namespace {
            message.topic = namespace.join(message.topic.as_str(), self.bus.delimiter())?;
        }
        Ok(message)
    }

    /// The local topic an inbound wire topic maps to.
    fn local_topic(&self, topic: &TopicKey) -> BusResult<TopicKey> {
        let delimiter = self.bus.delimiter();
        let local = self
            .namespace
            .as_ref()
            .and_then(|ns| topic.strip_prefix(ns.as_str(), delimiter))
            .unwrap_or(topic.as_str());
        TopicKey::parse_with(local, delimiter)
    }

    async fn serve(self: Arc<Self>, message: Message) {
        let topic = match self.local_topic(&message.topic) {
            Ok(topic) => topic,
            Err(e) => {
                debug!(topic = %message.topic, error = %e, "Ignoring message with a foreign topic");
                return;
            }
        };
        if !matches!(self.bus.has_handlers(&topic), Ok(true)) {
            trace!(topic = %message.topic, "No local handlers, ignoring message");
            return;
        }

        let sender: BoxedSender = Arc::new(ServiceBus {
            inner: Arc::clone(&self),
        });
        let request = DispatchRequest::new(Matcher::Exact(topic), message.payload.clone())
            .with_message(Arc::new(message.clone()))
            .with_sender(sender);
        let outcome = self.bus.dispatch_request(request).await;

        if message.acknowledge {
            if let Err(e) = self.message_bus.reply(&message, &outcome).await {
                warn!(topic = %message.topic, id = %message.id, error = %e, "Failed to send reply");
            }
        } else if let Err(err) = outcome {
            // Handler failures were already reported by the cascade.
            if err.is_no_handlers() {
                self.bus.report_error(err, None);
            }
        }
    }
}

fn spawn_serve(inner: &Weak<ServiceInner>, message: Message) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Ok(runtime) = Handle::try_current() else {
        warn!(topic = %message.topic, "Inbound message outside a tokio runtime, dropping it");
        return;
    };
    let span = debug_span!("serve", topic = %message.topic, id = %message.id);
    runtime.spawn(inner.serve(message).instrument(span));
}

// =============================================================================
// Extracted
// =============================================================================

/// A remote view of the methods below a prefix.
///
/// ```rust,ignore
/// let math = service.extract("math")?;
/// let sum = math.call("add", json!([1, 2])).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Extracted {
    service: ServiceBus,
    prefix: TopicKey,
}

impl Extracted {
    pub fn prefix(&self) -> &TopicKey {
        &self.prefix
    }

    /// Sends `payload` to `prefix.name` and waits for the reply.
    pub async fn call(&self, name: &str, payload: Value) -> BusResult<Value> {
        let topic = self.prefix.join(name, self.service.bus().delimiter())?;
        self.service
            .send_message(Message::new(topic, payload))
            .await
    }

    /// Publishes `payload` to `prefix.name`.
    pub async fn notify(&self, name: &str, payload: Value) -> BusResult<()> {
        let topic = self.prefix.join(name, self.service.bus().delimiter())?;
        self.service
            .publish_message(Message::new(topic, payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio_test::assert_ok;

    use super::*;
    use conduit_core::CorrelationConfig;
    use conduit_framework::{Context, Params};
    use conduit_transport::{ChannelTransport, TransportRouter};

    fn calculator() -> Bus {
        let bus = Bus::new();
        bus.subscribe("math.add", |Params(items): Params<Vec<i64>>| async move {
            items.iter().sum::<i64>()
        })
        .unwrap();
        bus.subscribe("math.div", |Params((a, b)): Params<(i64, i64)>| async move {
            if b == 0 {
                Err(BusError::handler("division by zero"))
            } else {
                Ok(json!(a / b))
            }
        })
        .unwrap();
        bus
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let service = ServiceBus::connect(calculator(), MessageBus::loopback(), "calc").unwrap();

        assert_eq!(service.send("math.add", json!([1, 2, 3])).await.unwrap(), json!(6));
        assert_eq!(service.message_bus().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_a_rejection() {
        let service = ServiceBus::connect(calculator(), MessageBus::loopback(), "calc").unwrap();

        let err = service.send("math.div", json!([1, 0])).await.unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn test_send_needs_local_handlers() {
        let service = ServiceBus::connect(calculator(), MessageBus::loopback(), "calc").unwrap();

        let err = service.send("math.mul", json!([2, 2])).await.unwrap_err();
        assert!(err.is_no_handlers());
        assert_eq!(err.to_string(), "No handlers registered for the math.mul topic.");
    }

    #[tokio::test]
    async fn test_publish_is_served_without_reply() {
        let bus = Bus::new();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe("audit.record", move |Params(n): Params<i64>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(n);
            }
        })
        .unwrap();
        let service = ServiceBus::connect(bus, MessageBus::loopback(), "").unwrap();

        assert_ok!(service.publish("audit.record", json!(7)).await);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(service.message_bus().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_nested_send_forks_the_message() {
        let bus = calculator();
        bus.subscribe("trace.parent", |ctx: Context| async move {
            ctx.message().map(|m| m.parent_id.is_some())
        })
        .unwrap();
        bus.subscribe("trace.outer", |ctx: Context| async move {
            ctx.send("trace.parent", Value::Null).await
        })
        .unwrap();
        bus.subscribe("math.double", |ctx: Context| async move {
            let n = ctx.params().as_i64().unwrap_or_default();
            ctx.send("math.add", json!([n, n])).await
        })
        .unwrap();
        let service = ServiceBus::connect(bus, MessageBus::loopback(), "calc").unwrap();

        assert_eq!(service.send("trace.parent", Value::Null).await.unwrap(), json!(false));
        assert_eq!(service.send("trace.outer", Value::Null).await.unwrap(), json!(true));
        assert_eq!(service.send("math.double", json!(21)).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_extract() {
        let service = ServiceBus::connect(calculator(), MessageBus::loopback(), "calc").unwrap();
        let math = service.extract("math").unwrap();

        assert_eq!(math.call("add", json!([2, 3])).await.unwrap(), json!(5));
        assert!(
            math.call("pow", json!([2, 3]))
                .await
                .unwrap_err()
                .is_no_handlers()
        );
    }

    #[tokio::test]
    async fn test_outbound_route_to_another_bus() {
        let (left, right) = ChannelTransport::pair();

        let server_messages =
            MessageBus::new(TransportRouter::new(), &CorrelationConfig::default());
        server_messages.add_route(Regex::new(".*").unwrap(), Arc::new(right));
        let _server = ServiceBus::connect(calculator(), server_messages, "").unwrap();

        let client_messages = MessageBus::loopback();
        client_messages.add_route(Regex::new(r"^math\.").unwrap(), Arc::new(left));
        let client = ServiceBus::connect(Bus::new(), client_messages, "").unwrap();

        let err = client.send("math.add", json!([1, 1])).await.unwrap_err();
        assert!(err.is_no_handlers());

        client.add_route(Regex::new(r"^math\.").unwrap(), |message| message);
        assert_eq!(client.send("math.add", json!([1, 1])).await.unwrap(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_service_stops_answering() {
        let messages = MessageBus::new(
            TransportRouter::loopback(),
            &CorrelationConfig {
                reply_timeout_ms: 50,
            },
        );
        let service = ServiceBus::connect(calculator(), messages, "calc").unwrap();
        assert!(service.is_connected());

        service.disconnect();
        assert!(!service.is_connected());

        let err = service.send("math.add", json!([1])).await.unwrap_err();
        assert!(matches!(err, BusError::ReplyTimeout { .. }));
        assert_eq!(service.message_bus().reply_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_namespace() {
        let err = ServiceBus::new(Bus::new(), MessageBus::loopback(), "no spaces").unwrap_err();
        assert_eq!(err.kind(), "invalid_topic");
    }
}
