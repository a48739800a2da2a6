//! Topic registry and resolver.
//!
//! The registry stores handler registrations keyed by their [`Matcher`].
//! Exact registrations live in a map; pattern registrations live in a list
//! that is scanned on every resolve. Resolution merges both and orders the
//! result by descending priority, ties going to the most recent registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::trace;

use crate::topic::{Matcher, TopicKey};

/// Priority used when a registration does not specify one.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Free-form metadata attached to registrations and events.
pub type Meta = Map<String, Value>;

/// Stable identifier of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Registration
// =============================================================================

/// A handler bound to a matcher.
#[derive(Debug)]
pub struct Registration<H> {
    id: RegistrationId,
    matcher: Matcher,
    handler: H,
    priority: i64,
    meta: Meta,
    seq: u64,
}

impl<H> Registration<H> {
    /// Registration id.
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// The matcher this registration was made under.
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// The stored handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Execution priority; higher runs first.
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Metadata supplied at registration time.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Insertion sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

// =============================================================================
// TopicRegistry
// =============================================================================

/// Stores registrations and resolves topics to ordered handler lists.
#[derive(Debug)]
pub struct TopicRegistry<H> {
    exact: HashMap<TopicKey, Vec<Arc<Registration<H>>>>,
    patterns: Vec<Arc<Registration<H>>>,
    next_seq: u64,
    default_priority: i64,
}

impl<H> Default for TopicRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> TopicRegistry<H> {
    /// Creates an empty registry with [`DEFAULT_PRIORITY`].
    pub fn new() -> Self {
        Self::with_default_priority(DEFAULT_PRIORITY)
    }

    /// Creates an empty registry with a custom default priority.
    pub fn with_default_priority(default_priority: i64) -> Self {
        Self {
            exact: HashMap::new(),
            patterns: Vec::new(),
            next_seq: 0,
            default_priority,
        }
    }

    /// Adds a registration and returns its id.
    pub fn add(
        &mut self,
        matcher: Matcher,
        handler: H,
        priority: Option<i64>,
        meta: Meta,
    ) -> RegistrationId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let id = RegistrationId(seq);
        let registration = Arc::new(Registration {
            id,
            priority: priority.unwrap_or(self.default_priority),
            matcher: matcher.clone(),
            handler,
            meta,
            seq,
        });

        match matcher {
            Matcher::Exact(key) => self.exact.entry(key).or_default().push(registration),
            Matcher::Pattern(_) => self.patterns.push(registration),
        }

        trace!(registration = %id, "Registration added");
        id
    }

    /// Removes registrations made under `matcher`.
    ///
    /// With an id only that registration is removed, otherwise every
    /// registration under the matcher. Returns `true` when the matcher had
    /// registrations.
    pub fn remove(&mut self, matcher: &Matcher, id: Option<RegistrationId>) -> bool {
        match matcher {
            Matcher::Exact(key) => {
                let Some(list) = self.exact.get_mut(key) else {
                    return false;
                };
                match id {
                    Some(id) => list.retain(|r| r.id != id),
                    None => list.clear(),
                }
                if list.is_empty() {
                    self.exact.remove(key);
                }
                true
            }
            Matcher::Pattern(_) => {
                if !self.patterns.iter().any(|r| &r.matcher == matcher) {
                    return false;
                }
                self.patterns.retain(|r| {
                    &r.matcher != matcher || id.is_some_and(|id| r.id != id)
                });
                true
            }
        }
    }

    /// Resolves a dispatch target to the ordered list of registrations.
    ///
    /// An exact target collects the registrations under its key plus every
    /// pattern registration accepting the key. A pattern target collects every
    /// exact registration whose key it accepts plus the pattern registrations
    /// made under the same expression.
    pub fn resolve(&self, identifier: &Matcher) -> Vec<Arc<Registration<H>>> {
        let mut found: Vec<Arc<Registration<H>>> = match identifier {
            Matcher::Exact(key) => self
                .patterns
                .iter()
                .filter(|r| r.matcher.matches(key.as_str()))
                .chain(self.exact.get(key).into_iter().flatten())
                .cloned()
                .collect(),
            Matcher::Pattern(_) => self
                .exact
                .iter()
                .filter(|(key, _)| identifier.matches(key.as_str()))
                .flat_map(|(_, list)| list.iter())
                .chain(self.patterns.iter().filter(|r| &r.matcher == identifier))
                .cloned()
                .collect(),
        };

        found.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.seq.cmp(&a.seq)));
        found
    }

    /// Returns `true` when resolving `identifier` would find something.
    pub fn has_handlers(&self, identifier: &Matcher) -> bool {
        match identifier {
            Matcher::Exact(key) => {
                self.exact.contains_key(key)
                    || self.patterns.iter().any(|r| r.matcher.matches(key.as_str()))
            }
            Matcher::Pattern(_) => !self.resolve(identifier).is_empty(),
        }
    }

    /// Lists exact keys below `prefix` as `(suffix, key)` pairs, sorted by
    /// suffix.
    pub fn topics_under(&self, prefix: &str, delimiter: &str) -> Vec<(String, TopicKey)> {
        let mut topics: Vec<(String, TopicKey)> = self
            .exact
            .keys()
            .filter_map(|key| {
                key.strip_prefix(prefix, delimiter)
                    .map(|suffix| (suffix.to_string(), key.clone()))
            })
            .collect();
        topics.sort();
        topics
    }

    /// Every registered matcher, exact keys first.
    pub fn matchers(&self) -> Vec<Matcher> {
        let mut keys: Vec<&TopicKey> = self.exact.keys().collect();
        keys.sort();
        let mut matchers: Vec<Matcher> = keys.into_iter().cloned().map(Matcher::Exact).collect();
        for r in &self.patterns {
            if !matchers.contains(&r.matcher) {
                matchers.push(r.matcher.clone());
            }
        }
        matchers
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.patterns.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
