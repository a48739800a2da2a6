//! Listener sets with drop-to-detach handles.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::error::HandlerError;

/// A shared synchronous listener.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// A set of listeners notified in registration order.
///
/// Listener panics are caught and logged; they never reach the emitter.
pub struct ListenerSet<T: ?Sized> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T: ?Sized> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: ?Sized> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.inner.lock().entries.len())
            .finish()
    }
}

impl<T: ?Sized + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener; it stays attached while the handle lives.
    pub fn add(&self, listener: Listener<T>) -> ListenerHandle {
        let id = {
            let mut slots = self.inner.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.entries.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.inner);
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().entries.retain(|(slot, _)| *slot != id);
            }
        })
    }

    /// Notifies every listener and returns how many were called.
    pub fn emit(&self, value: &T) -> usize {
        // Snapshot so listeners may attach or detach while being notified.
        let listeners: Vec<Listener<T>> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in &listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                let err = HandlerError::from_panic(payload);
                error!(error = %err, "Listener panicked");
            }
        }
        listeners.len()
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a listener attached; dropping it detaches the listener.
#[must_use = "dropping the handle detaches the listener"]
pub struct ListenerHandle {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Wraps a detach callback.
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A handle that detaches nothing.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Detaches the listener now.
    pub fn detach(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    /// Keeps the listener attached for the lifetime of its set.
    pub fn forget(mut self) {
        self.detach = None;
    }

    /// Combines several handles into one.
    pub fn merge(handles: Vec<ListenerHandle>) -> Self {
        Self::new(move || drop(handles))
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(hits: &Arc<AtomicUsize>) -> Listener<u32> {
        let hits = Arc::clone(hits);
        Arc::new(move |n: &u32| {
            hits.fetch_add(*n as usize, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_and_detach_on_drop() {
        let set = ListenerSet::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let handle = set.add(counter(&hits));
        assert_eq!(set.emit(&2), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(handle);
        assert_eq!(set.emit(&2), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_forget_keeps_listener() {
        let set = ListenerSet::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        set.add(counter(&hits)).forget();
        set.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let set = ListenerSet::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _boom = set.add(Arc::new(|n: &u32| {
            if *n > 0 {
                panic!("listener failure")
            }
        }));
        let _count = set.add(counter(&hits));

        assert_eq!(set.emit(&5), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_merge_detaches_all() {
        let set = ListenerSet::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let merged = ListenerHandle::merge(vec![set.add(counter(&hits)), set.add(counter(&hits))]);
        assert_eq!(set.len(), 2);
        merged.detach();
        assert!(set.is_empty());
    }
}
