//! Topic based transport selection.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use conduit_core::{BoxedTransport, Regex, TopicKey, TransportError, TransportResult};

use crate::loopback::LoopbackTransport;

/// A transport serving every topic its pattern matches.
#[derive(Clone)]
pub struct Route {
    pub pattern: Regex,
    pub transport: BoxedTransport,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.as_str())
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Ordered routes; the newest matching route wins.
#[derive(Default)]
pub struct TransportRouter {
    routes: RwLock<Vec<Route>>,
}

impl TransportRouter {
    /// A router without routes. Every lookup fails until one is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with one loopback route matching every topic.
    pub fn loopback() -> Self {
        let router = Self::new();
        router.add_route(match_all(), Arc::new(LoopbackTransport::new()));
        router
    }

    /// Adds a route ahead of the existing ones.
    pub fn add_route(&self, pattern: Regex, transport: BoxedTransport) {
        debug!(pattern = %pattern, transport = %transport.name(), "Route added");
        self.routes.write().insert(0, Route { pattern, transport });
    }

    /// The transport for `topic`.
    pub fn route(&self, topic: &TopicKey) -> TransportResult<BoxedTransport> {
        self.routes
            .read()
            .iter()
            .find(|route| route.pattern.is_match(topic.as_str()))
            .map(|route| Arc::clone(&route.transport))
            .ok_or_else(|| TransportError::NoRoute {
                topic: topic.to_string(),
            })
    }

    /// Every distinct transport, in route order.
    pub fn transports(&self) -> Vec<BoxedTransport> {
        let mut transports: Vec<BoxedTransport> = Vec::new();
        for route in self.routes.read().iter() {
            if !transports.iter().any(|t| Arc::ptr_eq(t, &route.transport)) {
                transports.push(Arc::clone(&route.transport));
            }
        }
        transports
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }
}

impl fmt::Debug for TransportRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.read().iter()).finish()
    }
}

fn match_all() -> Regex {
    Regex::new(".*").expect("Failed to compile match-all pattern")
}
