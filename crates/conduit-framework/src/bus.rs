//! The [`Bus`] facade.
//!
//! A bus owns a topic registry of boxed handlers and exposes the public
//! surface: subscribe, dispatch, publish, lookup and the lifecycle hooks.
//!
//! ```rust,ignore
//! let bus = Bus::new();
//!
//! bus.subscribe("say.hello", |Params(name): Params<String>| async move {
//!     json!(format!("Hello, {name}!"))
//! })?;
//!
//! let greeting = bus.dispatch("say.hello", json!("world")).await?;
//! ```
//!
//! # Dispatch lifecycle
//!
//! ```text
//! Created ──▶ Resolving ──▶ NoHandlers
//!                  │
//!                  └──(before:<topic>)──▶ Cascading ──▶ Settled ──(after:<topic>)
//! ```
//!
//! Resolution takes an owned snapshot of the matching registrations, so
//! subscribing or unsubscribing while a cascade runs never changes it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use serde_json::Value;
use tower::Service;
use tower_layer::Layer;
use tracing::{Instrument, debug, debug_span};

use conduit_core::{
    BoxedSender, BusConfig, BusError, BusResult, Event, EventOverrides, IntoMatcher,
    ListenerHandle, Matcher, Message, Meta, Outcome, RegistrationId, TopicKey, TopicRegistry,
};

use crate::cascade::{self, HandlerQueue};
use crate::context::Lineage;
use crate::handler::{BoxedHandler, Handler, into_handler};
use crate::hooks::{AfterDispatch, BeforeDispatch, ErrorReport, Hooks, SubscriptionChange};
use crate::lookup::Lookup;
use crate::pipeline::{self, BoxedLayer};

/// Rewrites a dispatch request before it is resolved.
pub type Middleware = Arc<dyn Fn(DispatchRequest) -> DispatchRequest + Send + Sync>;

// =============================================================================
// DispatchRequest
// =============================================================================

/// Everything a dispatch starts from.
#[derive(Clone)]
pub struct DispatchRequest {
    /// What to resolve.
    pub target: Matcher,
    /// Params handed to the first handler.
    pub params: Value,
    /// Metadata of the event created for this dispatch.
    pub meta: Meta,
    parent: Option<Arc<Event>>,
    message: Option<Arc<Message>>,
    sender: Option<BoxedSender>,
}

impl DispatchRequest {
    pub fn new(target: Matcher, params: Value) -> Self {
        Self {
            target,
            params,
            meta: Meta::new(),
            parent: None,
            message: None,
            sender: None,
        }
    }

    /// A request that re-creates `event` with its identifier, meta and parent.
    pub fn from_event(event: &Event, params: Value) -> Self {
        let mut request =
            Self::new(event.identifier().clone(), params).with_meta(event.meta().clone());
        request.parent = event.parent().cloned();
        request
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Makes the dispatch event a child of `parent`.
    pub fn with_parent(mut self, parent: Arc<Event>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The transport message being served.
    pub fn with_message(mut self, message: Arc<Message>) -> Self {
        self.message = Some(message);
        self
    }

    /// Outbound side for `ctx.send` and `ctx.publish`.
    pub fn with_sender(mut self, sender: BoxedSender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Child of an existing dispatch: parent event, message and sender.
    pub fn with_lineage(mut self, lineage: &Lineage) -> Self {
        self.parent = Some(Arc::clone(&lineage.event));
        self.message = lineage.message.clone();
        self.sender = lineage.sender.clone();
        self
    }

    pub fn parent(&self) -> Option<&Arc<Event>> {
        self.parent.as_ref()
    }

    fn into_parts(self) -> (Value, Lineage) {
        let event = match self.parent {
            Some(parent) => parent.fork(
                EventOverrides::new()
                    .identifier(self.target)
                    .meta(self.meta),
            ),
            None => Event::new(self.target).with_meta(self.meta),
        };
        let lineage = Lineage {
            event: Arc::new(event),
            message: self.message,
            sender: self.sender,
        };
        (self.params, lineage)
    }
}

impl fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("target", &self.target.to_string())
            .field("params", &self.params)
            .field("meta", &self.meta)
            .field("parent", &self.parent.as_ref().map(|p| p.uid()))
            .finish()
    }
}

// =============================================================================
// Bus
// =============================================================================

struct BusInner {
    config: BusConfig,
    registry: RwLock<TopicRegistry<BoxedHandler>>,
    middlewares: RwLock<Vec<Middleware>>,
    hooks: Hooks,
}

/// The message bus facade. Cloning is cheap and shares the registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// A bus with the default `.` delimiter and priority 1.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(TopicRegistry::with_default_priority(
                    config.default_priority,
                )),
                config,
                middlewares: RwLock::new(Vec::new()),
                hooks: Hooks::default(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Topic segment delimiter.
    pub fn delimiter(&self) -> &str {
        &self.inner.config.delimiter
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Subscribes `handler` to `target` with the default priority.
    pub fn subscribe<M, H, T>(&self, target: M, handler: H) -> BusResult<Subscription>
    where
        M: IntoMatcher,
        H: Handler<T>,
        T: 'static,
    {
        self.route(target).handler(handler)
    }

    /// Subscribes `handler` to `target`; higher priorities run first.
    pub fn subscribe_with_priority<M, H, T>(
        &self,
        target: M,
        priority: i64,
        handler: H,
    ) -> BusResult<Subscription>
    where
        M: IntoMatcher,
        H: Handler<T>,
        T: 'static,
    {
        self.route(target).priority(priority).handler(handler)
    }

    /// Starts a registration with priority, meta and layers.
    pub fn route(&self, target: impl IntoMatcher) -> RouteBuilder {
        RouteBuilder {
            bus: self.clone(),
            target: target.into_matcher(self.delimiter()),
            priority: None,
            meta: Meta::new(),
            layers: Vec::new(),
        }
    }

    /// Registers an already boxed handler.
    pub fn subscribe_boxed(
        &self,
        matcher: Matcher,
        handler: BoxedHandler,
        priority: Option<i64>,
        meta: Meta,
    ) -> Subscription {
        let id = self
            .inner
            .registry
            .write()
            .add(matcher.clone(), handler, priority, meta);

        debug!(matcher = %matcher, registration = %id, "Handler subscribed");
        self.inner.hooks.emit_subscribed(&SubscriptionChange {
            matcher: matcher.clone(),
            id: Some(id),
        });

        Subscription {
            bus: Arc::downgrade(&self.inner),
            matcher,
            id,
        }
    }

    /// Subscribes `prefix` + delimiter + `name` for every entry.
    ///
    /// Every name is validated before anything is registered.
    pub fn subscribe_map<I, S>(
        &self,
        prefix: &str,
        entries: I,
    ) -> BusResult<BTreeMap<String, Subscription>>
    where
        I: IntoIterator<Item = (S, BoxedHandler)>,
        S: Into<String>,
    {
        let prefix = TopicKey::parse_with(prefix, self.delimiter())?;
        let entries = entries
            .into_iter()
            .map(|(name, handler)| -> BusResult<_> {
                let name = name.into();
                let key = prefix.join(&name, self.delimiter())?;
                Ok((name, key, handler))
            })
            .collect::<BusResult<Vec<_>>>()?;

        Ok(entries
            .into_iter()
            .map(|(name, key, handler)| {
                let subscription =
                    self.subscribe_boxed(Matcher::Exact(key), handler, None, Meta::new());
                (name, subscription)
            })
            .collect())
    }

    /// Removes registrations under `target`: one by id, or all of them.
    ///
    /// Returns `true` when the matcher had registrations.
    pub fn unsubscribe(
        &self,
        target: impl IntoMatcher,
        id: Option<RegistrationId>,
    ) -> BusResult<bool> {
        let matcher = target.into_matcher(self.delimiter())?;
        Ok(self.remove(&matcher, id))
    }

    fn remove(&self, matcher: &Matcher, id: Option<RegistrationId>) -> bool {
        let removed = self.inner.registry.write().remove(matcher, id);
        if removed {
            debug!(matcher = %matcher, "Handler unsubscribed");
            self.inner.hooks.emit_unsubscribed(&SubscriptionChange {
                matcher: matcher.clone(),
                id,
            });
        }
        removed
    }

    /// Returns `true` when dispatching `target` would find a handler.
    pub fn has_handlers(&self, target: impl IntoMatcher) -> BusResult<bool> {
        let matcher = target.into_matcher(self.delimiter())?;
        Ok(self.inner.registry.read().has_handlers(&matcher))
    }

    /// Every registered matcher.
    pub fn matchers(&self) -> Vec<Matcher> {
        self.inner.registry.read().matchers()
    }

    /// Adds a middleware; middlewares run in registration order.
    pub fn use_middleware(
        &self,
        middleware: impl Fn(DispatchRequest) -> DispatchRequest + Send + Sync + 'static,
    ) {
        self.inner.middlewares.write().push(Arc::new(middleware));
    }

    // -------------------------------------------------------------------------
    // Hooks
    // -------------------------------------------------------------------------

    /// Listens for `before:<target>`.
    pub fn on_before(
        &self,
        target: impl IntoMatcher,
        listener: impl Fn(&BeforeDispatch) + Send + Sync + 'static,
    ) -> BusResult<ListenerHandle> {
        let matcher = target.into_matcher(self.delimiter())?;
        Ok(self.inner.hooks.on_before(&matcher, Arc::new(listener)))
    }

    /// Listens for `after:<target>`.
    pub fn on_after(
        &self,
        target: impl IntoMatcher,
        listener: impl Fn(&AfterDispatch) + Send + Sync + 'static,
    ) -> BusResult<ListenerHandle> {
        let matcher = target.into_matcher(self.delimiter())?;
        Ok(self.inner.hooks.on_after(&matcher, Arc::new(listener)))
    }

    /// Listens on the error channel.
    pub fn on_error(
        &self,
        listener: impl Fn(&ErrorReport) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.hooks.on_error(Arc::new(listener))
    }

    pub fn on_subscribed(
        &self,
        listener: impl Fn(&SubscriptionChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.hooks.on_subscribed(Arc::new(listener))
    }

    pub fn on_unsubscribed(
        &self,
        listener: impl Fn(&SubscriptionChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.hooks.on_unsubscribed(Arc::new(listener))
    }

    /// Mirrors an externally observed failure onto the error channel.
    pub fn report_error(&self, error: BusError, event: Option<Arc<Event>>) {
        self.inner.hooks.emit_error(&ErrorReport { error, event });
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Runs the cascade for `target` and resolves with the settled result.
    pub async fn dispatch(&self, target: impl IntoMatcher, params: Value) -> Outcome {
        let target = target.into_matcher(self.delimiter())?;
        self.dispatch_request(DispatchRequest::new(target, params))
            .await
    }

    /// Dispatches a pre-built event.
    pub async fn dispatch_event(&self, event: Event, params: Value) -> Outcome {
        self.dispatch_request(DispatchRequest::from_event(&event, params))
            .await
    }

    /// Dispatches a fully specified request.
    pub async fn dispatch_request(&self, request: DispatchRequest) -> Outcome {
        let request = self.apply_middlewares(request);
        let queue = self.resolve(&request.target);
        if queue.is_empty() {
            debug!(topic = %request.target, "No handlers registered");
            return Err(BusError::no_handlers(&request.target));
        }

        let (params, lineage) = request.into_parts();
        let event = Arc::clone(&lineage.event);
        debug!(
            topic = %event.identifier(),
            uid = %event.uid(),
            handlers = queue.len(),
            "Dispatching"
        );

        self.inner.hooks.emit_before(&BeforeDispatch {
            params: params.clone(),
            event: Arc::clone(&event),
            bus: self.clone(),
        });

        let span = debug_span!("dispatch", topic = %event.identifier(), uid = %event.uid());
        let outcome = cascade::run(queue, 0, params.clone(), lineage, self.clone())
            .instrument(span)
            .await;

        self.inner.hooks.emit_after(&AfterDispatch {
            params,
            event: Arc::clone(&event),
            outcome: outcome.clone(),
            bus: self.clone(),
        });
        outcome
    }

    /// Runs every handler matching `target` concurrently, without `next`.
    ///
    /// Results are returned in resolution order, each settled independently.
    pub async fn publish(
        &self,
        target: impl IntoMatcher,
        params: Value,
    ) -> BusResult<Vec<Outcome>> {
        let target = target.into_matcher(self.delimiter())?;
        self.publish_request(DispatchRequest::new(target, params))
            .await
    }

    /// Publishes a fully specified request.
    pub async fn publish_request(&self, request: DispatchRequest) -> BusResult<Vec<Outcome>> {
        let request = self.apply_middlewares(request);
        let queue = self.resolve(&request.target);
        if queue.is_empty() {
            debug!(topic = %request.target, "No handlers registered");
            return Err(BusError::no_handlers(&request.target));
        }

        let (params, lineage) = request.into_parts();
        let span = debug_span!(
            "publish",
            topic = %lineage.event.identifier(),
            uid = %lineage.event.uid()
        );

        let runs = queue.iter().map(|registration| {
            cascade::run_single(
                Arc::clone(registration),
                params.clone(),
                lineage.clone(),
                self.clone(),
            )
        });
        Ok(join_all(runs).instrument(span).await)
    }

    /// Methods registered below `prefix`.
    pub fn lookup(&self, prefix: &str) -> BusResult<Lookup> {
        self.lookup_with(prefix, None)
    }

    pub(crate) fn lookup_with(&self, prefix: &str, lineage: Option<Lineage>) -> BusResult<Lookup> {
        let prefix = TopicKey::parse_with(prefix, self.delimiter())?;
        let methods = self
            .inner
            .registry
            .read()
            .topics_under(prefix.as_str(), self.delimiter())
            .into_iter()
            .collect();
        Ok(Lookup::new(self.clone(), prefix, methods, lineage))
    }

    fn apply_middlewares(&self, request: DispatchRequest) -> DispatchRequest {
        let middlewares = self.inner.middlewares.read().clone();
        middlewares
            .iter()
            .fold(request, |request, middleware| middleware(request))
    }

    fn resolve(&self, target: &Matcher) -> HandlerQueue {
        self.inner.registry.read().resolve(target).into()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.inner.config)
            .field("registrations", &self.inner.registry.read().len())
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

/// `Bus` as a tower service over dispatch requests.
impl Service<DispatchRequest> for Bus {
    type Response = Value;
    type Error = BusError;
    type Future = BoxFuture<'static, Outcome>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: DispatchRequest) -> Self::Future {
        let bus = self.clone();
        async move { bus.dispatch_request(request).await }.boxed()
    }
}

// =============================================================================
// RouteBuilder
// =============================================================================

/// Builder for a single registration.
#[must_use = "a route does nothing until `handler` is called"]
pub struct RouteBuilder {
    bus: Bus,
    target: BusResult<Matcher>,
    priority: Option<i64>,
    meta: Meta,
    layers: Vec<BoxedLayer>,
}

impl RouteBuilder {
    /// Higher priorities run first.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a metadata entry, recorded on events as handler meta.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Wraps the handler; the first layer added is the outermost.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<BoxedHandler, Service = BoxedHandler> + Send + Sync + 'static,
    {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Registers `handler`.
    pub fn handler<H, T>(self, handler: H) -> BusResult<Subscription>
    where
        H: Handler<T>,
        T: 'static,
    {
        self.boxed(into_handler(handler))
    }

    /// Registers an already boxed handler.
    pub fn boxed(self, handler: BoxedHandler) -> BusResult<Subscription> {
        let matcher = self.target?;
        let handler = pipeline::apply(handler, &self.layers);
        Ok(self
            .bus
            .subscribe_boxed(matcher, handler, self.priority, self.meta))
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A live registration. Dropping it keeps the handler registered.
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    matcher: Matcher,
    id: RegistrationId,
}

impl Subscription {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Removes this registration only. Returns `false` if the bus is gone or
    /// the matcher has no registrations left.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => Bus { inner }.remove(&self.matcher, Some(self.id)),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("matcher", &self.matcher.to_string())
            .field("id", &self.id)
            .finish()
    }
}
