//! Per-invocation handler context.
//!
//! A [`Context`] is created for every handler the cascade invokes. It carries
//! the params, the lineage of the dispatch (event, originating message,
//! outbound sender), the handler's settlement gate and the continuation to
//! the next handler. Nested `dispatch`, `lookup`, `send` and `publish` calls
//! made through the context are linked to the current lineage.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use conduit_core::{
    BoxedSender, BusError, BusResult, Event, IntoMatcher, Message, MessageOverrides, Meta,
    Outcome, Settlement, TopicKey, TransportError,
};

use crate::bus::{Bus, DispatchRequest};
use crate::cascade::{self, Next};
use crate::handler::IntoSettlement;
use crate::lookup::Lookup;

// =============================================================================
// Lineage
// =============================================================================

/// Where a dispatch came from.
#[derive(Clone)]
pub struct Lineage {
    /// The event of this dispatch.
    pub event: Arc<Event>,
    /// The transport message being served, if any.
    pub message: Option<Arc<Message>>,
    /// Outbound side used by `send` and `publish`.
    pub sender: Option<BoxedSender>,
}

impl fmt::Debug for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lineage")
            .field("event", &self.event.uid())
            .field("message", &self.message.as_ref().map(|m| m.id))
            .field("has_sender", &self.sender.is_some())
            .finish()
    }
}

// =============================================================================
// Context
// =============================================================================

/// The context handed to a handler.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    params: Value,
    handler_meta: Meta,
    lineage: Lineage,
    gate: Arc<Settlement>,
    next: Option<Next>,
    bus: Bus,
}

impl Context {
    pub(crate) fn new(
        params: Value,
        handler_meta: Meta,
        lineage: Lineage,
        gate: Arc<Settlement>,
        next: Option<Next>,
        bus: Bus,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                params,
                handler_meta,
                lineage,
                gate,
                next,
                bus,
            }),
        }
    }

    /// Same context with different params. Used by handler layers.
    pub fn with_params(&self, params: Value) -> Self {
        let inner = &self.inner;
        Self::new(
            params,
            inner.handler_meta.clone(),
            inner.lineage.clone(),
            Arc::clone(&inner.gate),
            inner.next.clone(),
            inner.bus.clone(),
        )
    }

    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Deserializes the params.
    pub fn params_as<T: DeserializeOwned>(&self) -> BusResult<T> {
        serde_json::from_value(self.inner.params.clone())
            .map_err(|e| BusError::Extract(e.to_string()))
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.inner.lineage.event
    }

    /// The transport message being served, when dispatched by a service bus.
    pub fn message(&self) -> Option<&Arc<Message>> {
        self.inner.lineage.message.as_ref()
    }

    /// Metadata of the registration being invoked.
    pub fn handler_meta(&self) -> &Meta {
        &self.inner.handler_meta
    }

    pub fn lineage(&self) -> &Lineage {
        &self.inner.lineage
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Settles the handler result.
    ///
    /// `()` and `None` settle `null`; `Err` values settle as failures.
    /// Fails with [`BusError::DoubleSettlement`] once already settled.
    pub fn reply(&self, value: impl IntoSettlement) -> BusResult<()> {
        self.settle(value.into_settlement().unwrap_or(Ok(Value::Null)))
    }

    /// Settles the handler with a raw outcome.
    pub fn settle(&self, outcome: Outcome) -> BusResult<()> {
        cascade::settle(
            &self.inner.gate,
            outcome,
            &self.inner.bus,
            &self.inner.lineage.event,
        )
    }

    pub fn is_settled(&self) -> bool {
        self.inner.gate.is_settled()
    }

    /// A detached handle that can settle this handler from another task.
    pub fn responder(&self) -> Responder {
        Responder {
            gate: Arc::clone(&self.inner.gate),
            bus: self.inner.bus.clone(),
            event: Arc::clone(&self.inner.lineage.event),
        }
    }

    // -------------------------------------------------------------------------
    // Cascade
    // -------------------------------------------------------------------------

    /// The continuation to the next handler; `None` for the last one.
    pub fn continuation(&self) -> Option<&Next> {
        self.inner.next.as_ref()
    }

    pub fn has_next(&self) -> bool {
        self.inner.next.is_some()
    }

    /// Runs the rest of the cascade with `params`.
    ///
    /// The last handler of a cascade gets its params back unchanged.
    pub async fn next(&self, params: Value) -> Outcome {
        match &self.inner.next {
            Some(next) => next.run(params).await,
            None => Ok(params),
        }
    }

    // -------------------------------------------------------------------------
    // Nested calls
    // -------------------------------------------------------------------------

    /// Dispatches a child event of the current one.
    pub async fn dispatch(&self, target: impl IntoMatcher, params: Value) -> Outcome {
        let target = target.into_matcher(self.inner.bus.delimiter())?;
        let request = DispatchRequest::new(target, params).with_lineage(&self.inner.lineage);
        self.inner.bus.dispatch_request(request).await
    }

    /// Dispatches a pre-built event, re-parented under the current one.
    pub async fn dispatch_event(&self, event: Event, params: Value) -> Outcome {
        let request = DispatchRequest::from_event(&event, params).with_lineage(&self.inner.lineage);
        self.inner.bus.dispatch_request(request).await
    }

    /// Publishes locally to every matching handler, as a child event.
    pub async fn broadcast(
        &self,
        target: impl IntoMatcher,
        params: Value,
    ) -> BusResult<Vec<Outcome>> {
        let target = target.into_matcher(self.inner.bus.delimiter())?;
        let request = DispatchRequest::new(target, params).with_lineage(&self.inner.lineage);
        self.inner.bus.publish_request(request).await
    }

    /// A lookup whose calls are children of the current event.
    pub fn lookup(&self, prefix: &str) -> BusResult<Lookup> {
        self.inner
            .bus
            .lookup_with(prefix, Some(self.inner.lineage.clone()))
    }

    /// Sends a message over the transport and waits for the reply.
    pub async fn send(&self, topic: &str, payload: Value) -> BusResult<Value> {
        let (sender, message) = self.outbound(topic, payload, true)?;
        sender.send(message).await
    }

    /// Sends a fire-and-forget message over the transport.
    pub async fn publish(&self, topic: &str, payload: Value) -> BusResult<()> {
        let (sender, message) = self.outbound(topic, payload, false)?;
        sender.publish(message).await
    }

    fn outbound(
        &self,
        topic: &str,
        payload: Value,
        acknowledge: bool,
    ) -> BusResult<(BoxedSender, Message)> {
        let lineage = &self.inner.lineage;
        let sender = lineage.sender.clone().ok_or(TransportError::NotAvailable {
            transport: "message bus",
        })?;
        let topic = TopicKey::parse_with(topic, self.inner.bus.delimiter())?;

        let message = match &lineage.message {
            Some(origin) => origin.fork(
                MessageOverrides::new()
                    .topic(topic)
                    .payload(payload)
                    .acknowledge(acknowledge),
            ),
            None => {
                let message = Message::new(topic, payload).with_parent(lineage.event.uid());
                if acknowledge {
                    message
                } else {
                    message.without_ack()
                }
            }
        };
        Ok((sender, message))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("params", &self.inner.params)
            .field("lineage", &self.inner.lineage)
            .field("settled", &self.is_settled())
            .field("has_next", &self.has_next())
            .finish()
    }
}

// =============================================================================
// Responder
// =============================================================================

/// Settles a handler from outside its body.
///
/// While a responder is alive the dispatch keeps waiting, even after the
/// handler function returned.
#[derive(Clone)]
pub struct Responder {
    gate: Arc<Settlement>,
    bus: Bus,
    event: Arc<Event>,
}

impl Responder {
    /// See [`Context::reply`].
    pub fn reply(&self, value: impl IntoSettlement) -> BusResult<()> {
        self.settle(value.into_settlement().unwrap_or(Ok(Value::Null)))
    }

    pub fn settle(&self, outcome: Outcome) -> BusResult<()> {
        cascade::settle(&self.gate, outcome, &self.bus, &self.event)
    }

    pub fn is_settled(&self) -> bool {
        self.gate.is_settled()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("event", &self.event.uid())
            .field("settled", &self.is_settled())
            .finish()
    }
}
