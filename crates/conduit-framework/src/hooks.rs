//! Lifecycle hooks and observability signals.
//!
//! `before:<topic>` listeners run after resolution found handlers and right
//! before the cascade starts; `after:<topic>` listeners run once the dispatch
//! settled, with the outcome. A hook registered with a pattern fires for
//! every dispatched topic the pattern matches. The error channel receives every failed
//! settlement. Listeners are synchronous and cannot change a dispatch.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use conduit_core::{
    BusError, Event, Listener, ListenerHandle, ListenerSet, Matcher, Outcome, RegistrationId,
};

use crate::bus::Bus;

/// Passed to `before:<topic>` listeners.
#[derive(Clone)]
pub struct BeforeDispatch {
    pub params: Value,
    pub event: Arc<Event>,
    /// The bus, for listeners that want to dispatch themselves.
    pub bus: Bus,
}

/// Passed to `after:<topic>` listeners.
#[derive(Clone)]
pub struct AfterDispatch {
    pub params: Value,
    pub event: Arc<Event>,
    pub outcome: Outcome,
    pub bus: Bus,
}

/// A failure mirrored onto the error channel.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub error: BusError,
    pub event: Option<Arc<Event>>,
}

/// A registration added or removed.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub matcher: Matcher,
    /// `None` when every registration under the matcher was removed.
    pub id: Option<RegistrationId>,
}

impl fmt::Debug for BeforeDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeforeDispatch")
            .field("params", &self.params)
            .field("event", &self.event.uid())
            .finish()
    }
}

impl fmt::Debug for AfterDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterDispatch")
            .field("params", &self.params)
            .field("event", &self.event.uid())
            .field("outcome", &self.outcome)
            .finish()
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// All listener sets of one bus.
#[derive(Default)]
pub struct Hooks {
    before: RwLock<Vec<(Matcher, ListenerSet<BeforeDispatch>)>>,
    after: RwLock<Vec<(Matcher, ListenerSet<AfterDispatch>)>>,
    error: ListenerSet<ErrorReport>,
    subscribed: ListenerSet<SubscriptionChange>,
    unsubscribed: ListenerSet<SubscriptionChange>,
}

impl Hooks {
    pub(crate) fn on_before(
        &self,
        target: &Matcher,
        listener: Listener<BeforeDispatch>,
    ) -> ListenerHandle {
        listeners_for(&mut self.before.write(), target).add(listener)
    }

    pub(crate) fn on_after(
        &self,
        target: &Matcher,
        listener: Listener<AfterDispatch>,
    ) -> ListenerHandle {
        listeners_for(&mut self.after.write(), target).add(listener)
    }

    pub(crate) fn on_error(&self, listener: Listener<ErrorReport>) -> ListenerHandle {
        self.error.add(listener)
    }

    pub(crate) fn on_subscribed(&self, listener: Listener<SubscriptionChange>) -> ListenerHandle {
        self.subscribed.add(listener)
    }

    pub(crate) fn on_unsubscribed(
        &self,
        listener: Listener<SubscriptionChange>,
    ) -> ListenerHandle {
        self.unsubscribed.add(listener)
    }

    pub(crate) fn emit_before(&self, payload: &BeforeDispatch) -> usize {
        let sets = matching(&self.before.read(), &payload.event);
        sets.iter().map(|set| set.emit(payload)).sum()
    }

    pub(crate) fn emit_after(&self, payload: &AfterDispatch) -> usize {
        let sets = matching(&self.after.read(), &payload.event);
        sets.iter().map(|set| set.emit(payload)).sum()
    }

    pub(crate) fn emit_error(&self, report: &ErrorReport) -> usize {
        self.error.emit(report)
    }

    pub(crate) fn emit_subscribed(&self, change: &SubscriptionChange) -> usize {
        self.subscribed.emit(change)
    }

    pub(crate) fn emit_unsubscribed(&self, change: &SubscriptionChange) -> usize {
        self.unsubscribed.emit(change)
    }
}

/// The listener set registered under exactly `target`, created on first use.
fn listeners_for<'a, T: ?Sized + 'static>(
    hooks: &'a mut Vec<(Matcher, ListenerSet<T>)>,
    target: &Matcher,
) -> &'a ListenerSet<T> {
    let index = match hooks.iter().position(|(matcher, _)| matcher == target) {
        Some(index) => index,
        None => {
            hooks.push((target.clone(), ListenerSet::new()));
            hooks.len() - 1
        }
    };
    &hooks[index].1
}

/// Listener sets whose matcher accepts `event`, in registration order.
///
/// Cloned out so listeners run without the lock held.
fn matching<T: ?Sized + 'static>(
    hooks: &[(Matcher, ListenerSet<T>)],
    event: &Event,
) -> Vec<ListenerSet<T>> {
    hooks
        .iter()
        .filter(|(matcher, _)| event.is_match(matcher))
        .map(|(_, set)| set.clone())
        .collect()
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.read().len())
            .field("after", &self.after.read().len())
            .field("error", &self.error.len())
            .finish()
    }
}
