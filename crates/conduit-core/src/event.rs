//! In-process lineage records.
//!
//! Every dispatch creates an [`Event`]. Nested dispatches made from inside a
//! handler fork a child event, so the chain of `parent` links describes the
//! call tree. Events are shared as `Arc<Event>`; the only mutable part is the
//! `self_calls` trace, which the cascade appends to.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusResult;
use crate::registry::Meta;
use crate::topic::Matcher;

/// One handler invocation recorded on an event.
#[derive(Debug, Clone, Serialize)]
pub struct SelfCall {
    /// Parameters the handler was invoked with.
    pub params: Value,
    /// Metadata of the invoked registration.
    pub handler_meta: Meta,
}

/// A dispatch lineage node.
#[derive(Debug)]
pub struct Event {
    identifier: Matcher,
    parent: Option<Arc<Event>>,
    meta: Meta,
    uid: Uuid,
    self_calls: Mutex<Vec<SelfCall>>,
}

impl Event {
    /// Creates a root event.
    pub fn new(identifier: Matcher) -> Self {
        Self {
            identifier,
            parent: None,
            meta: Meta::new(),
            uid: Uuid::new_v4(),
            self_calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a root event for an exact topic.
    pub fn parse(topic: &str) -> BusResult<Self> {
        Matcher::exact(topic).map(Self::new)
    }

    /// Replaces the metadata.
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Forks a child event.
    ///
    /// The child gets a new uid and points at `self`; identifier and meta are
    /// inherited unless overridden.
    pub fn fork(self: &Arc<Self>, overrides: EventOverrides) -> Event {
        Event {
            identifier: overrides
                .identifier
                .unwrap_or_else(|| self.identifier.clone()),
            parent: Some(Arc::clone(self)),
            meta: overrides.meta.unwrap_or_else(|| self.meta.clone()),
            uid: Uuid::new_v4(),
            self_calls: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a child event with a new identifier.
    pub fn child(self: &Arc<Self>, identifier: Matcher) -> Event {
        self.fork(EventOverrides::new().identifier(identifier))
    }

    /// Re-parents this event: same identifier, new uid, `parent` as parent,
    /// meta merged with `extra_meta` (extra entries win).
    pub fn with_parent(&self, parent: Option<Arc<Event>>, extra_meta: Meta) -> Event {
        let mut meta = self.meta.clone();
        meta.extend(extra_meta);
        Event {
            identifier: self.identifier.clone(),
            parent,
            meta,
            uid: Uuid::new_v4(),
            self_calls: Mutex::new(Vec::new()),
        }
    }

    /// The dispatched matcher.
    pub fn identifier(&self) -> &Matcher {
        &self.identifier
    }

    /// Unique id of this event.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// The event this one was forked from.
    pub fn parent(&self) -> Option<&Arc<Event>> {
        self.parent.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Appends a handler invocation to the trace.
    pub fn record_call(&self, params: Value, handler_meta: Meta) {
        self.self_calls.lock().push(SelfCall {
            params,
            handler_meta,
        });
    }

    /// Snapshot of the handler invocations recorded so far.
    pub fn self_calls(&self) -> Vec<SelfCall> {
        self.self_calls.lock().clone()
    }

    /// Tests this event against a registration matcher.
    ///
    /// Exact identifiers compare by equality against exact matchers and are
    /// tested by pattern matchers. A pattern identifier accepts exact
    /// matchers whose key it matches, and pattern matchers with the same
    /// expression.
    pub fn is_match(&self, matcher: &Matcher) -> bool {
        match (&self.identifier, matcher) {
            (Matcher::Exact(key), other) => other.matches(key.as_str()),
            (pattern @ Matcher::Pattern(_), Matcher::Exact(key)) => pattern.matches(key.as_str()),
            (pattern, other) => pattern == other,
        }
    }

    /// Iterates from the parent up to the root.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: self.parent.as_deref(),
        }
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identifier, self.uid)
    }
}

/// Iterator over the ancestors of an event.
pub struct Ancestors<'a> {
    next: Option<&'a Event>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_deref();
        Some(current)
    }
}

/// Field overrides for [`Event::fork`].
#[derive(Debug, Clone, Default)]
pub struct EventOverrides {
    identifier: Option<Matcher>,
    meta: Option<Meta>,
}

impl EventOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identifier(mut self, identifier: Matcher) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }
}
