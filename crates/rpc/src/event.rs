//! Typed multicast events owned by hosted objects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Identifies one handler attached to an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A multicast event carrying arguments of type `A`.
///
/// Hosted objects own their events as plain fields; the server attaches to them
/// when the object is hosted and forwards every raise to remote subscribers.
pub struct Event<A> {
    handlers: RwLock<Vec<(HandlerId, Handler<A>)>>,
    next_id: AtomicU64,
}

impl<A> Event<A> {
    /// Create an event with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a handler.
    pub fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Detach a handler. Returns whether it was attached.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Invoke every attached handler.
    ///
    /// Handlers run on the caller's thread against a snapshot, so they may attach
    /// or detach handlers without deadlocking.
    pub fn raise(&self, args: &A) {
        let snapshot: Vec<Handler<A>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    /// Number of attached handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_raise_reaches_every_handler() {
        let event = Event::<i32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            event.subscribe(move |value| {
                total.fetch_add(usize::try_from(*value).unwrap(), Ordering::SeqCst);
            });
        }

        event.raise(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe() {
        let event = Event::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = event.subscribe(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(event.unsubscribe(id));
        assert!(!event.unsubscribe(id));
        event.raise(&());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(event.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_detach_itself() {
        let event = Arc::new(Event::<()>::new());
        let slot = Arc::new(parking_lot::Mutex::new(None::<HandlerId>));

        let inner_event = event.clone();
        let inner_slot = slot.clone();
        let id = event.subscribe(move |()| {
            if let Some(id) = inner_slot.lock().take() {
                inner_event.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        event.raise(&());
        assert_eq!(event.handler_count(), 0);
    }
}
