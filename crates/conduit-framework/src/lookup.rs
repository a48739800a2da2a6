//! Namespaced call views over a bus.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use conduit_core::{BusResult, Matcher, Outcome, TopicKey};

use crate::bus::{Bus, DispatchRequest};
use crate::context::Lineage;

/// Methods registered below a prefix, callable by name.
///
/// The method map is built from the registry when the lookup is created.
/// Calls always dispatch `prefix` + delimiter + `name`, so methods subscribed
/// later are still reachable and unknown names settle with `NoHandlers`.
#[derive(Clone)]
pub struct Lookup {
    bus: Bus,
    prefix: TopicKey,
    methods: BTreeMap<String, TopicKey>,
    lineage: Option<Lineage>,
}

impl Lookup {
    pub(crate) fn new(
        bus: Bus,
        prefix: TopicKey,
        methods: BTreeMap<String, TopicKey>,
        lineage: Option<Lineage>,
    ) -> Self {
        Self {
            bus,
            prefix,
            methods,
            lineage,
        }
    }

    pub fn prefix(&self) -> &TopicKey {
        &self.prefix
    }

    /// Method names known when the lookup was built.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// A bound method. Names may contain the delimiter.
    pub fn get(&self, name: &str) -> BusResult<Method> {
        let topic = match self.methods.get(name) {
            Some(topic) => topic.clone(),
            None => self.prefix.join(name, self.bus.delimiter())?,
        };
        Ok(Method {
            bus: self.bus.clone(),
            topic,
            lineage: self.lineage.clone(),
        })
    }

    /// Dispatches `name` with `params`.
    pub async fn call(&self, name: &str, params: Value) -> Outcome {
        self.get(name)?.call(params).await
    }
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup")
            .field("prefix", &self.prefix)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One callable topic out of a [`Lookup`].
#[derive(Clone)]
pub struct Method {
    bus: Bus,
    topic: TopicKey,
    lineage: Option<Lineage>,
}

impl Method {
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    pub async fn call(&self, params: Value) -> Outcome {
        let mut request = DispatchRequest::new(Matcher::Exact(self.topic.clone()), params);
        if let Some(lineage) = &self.lineage {
            request = request.with_lineage(lineage);
        }
        self.bus.dispatch_request(request).await
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Method").field(&self.topic).finish()
    }
}
