//! Multi-subscriber callback registry.
//!
//! Handlers run synchronously in registration order. The handler list is
//! snapshotted before dispatch, so a handler may subscribe or unsubscribe
//! (itself or others) without deadlocking; such changes apply from the next
//! notification on.

use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    handler: Handler<T>,
}

struct Inner<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

/// Ordered list of callbacks for values of type `T`.
pub struct Observers<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: 'static> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is unsubscribed.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                handler: Arc::new(handler),
            });
            id
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    inner.entries.retain(|e| e.id != id);
                }
            })),
        }
    }

    /// Invoke every handler with `value`. Never called with the lock held.
    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.entries.iter().map(|e| Arc::clone(&e.handler)).collect()
        };
        for handler in handlers {
            handler(value);
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or_default()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by a subscribe call.
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

impl Subscription {
    /// Remove the handler. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handlers_run_in_registration_order() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let _a = observers.subscribe(move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = Arc::clone(&seen);
        let _b = observers.subscribe(move |v| s2.lock().unwrap().push(("b", *v)));

        observers.notify(&1);
        observers.notify(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let observers = Observers::<()>::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = Arc::clone(&a);
        let mut sub_a = observers.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let b2 = Arc::clone(&b);
        let _sub_b = observers.subscribe(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify(&());
        sub_a.unsubscribe();
        sub_a.unsubscribe();
        observers.notify(&());

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_notify() {
        let observers = Arc::new(Observers::<()>::new());
        let inner = Arc::clone(&observers);
        let _sub = observers.subscribe(move |_| {
            let _nested = inner.subscribe(|_| {});
        });

        observers.notify(&());
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped_is_harmless() {
        let observers = Observers::<()>::new();
        let mut sub = observers.subscribe(|_| {});
        drop(observers);
        sub.unsubscribe();
    }
}
