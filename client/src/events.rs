//! Per-message-type handler registry for incoming server messages.

use log::warn;
use shared::{ServerMessage, ServerMessageKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

type Callback = Box<dyn FnMut(&ServerMessage) + Send>;

/// Token returned by [`EventBus::on`] and [`EventBus::once`], used to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Registration {
    handle: u64,
    once: bool,
    callback: Callback,
}

/// Dispatches decoded server messages to registered handlers.
///
/// Handlers for one message kind run in registration order. A panicking
/// handler is logged and dropped without affecting the others, so one broken
/// handler cannot take the connection loop down with it.
pub struct EventBus {
    subscribers: HashMap<ServerMessageKind, Vec<Registration>>,
    next_handle: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Registers a handler that fires on every message of `kind`.
    pub fn on<F>(&mut self, kind: ServerMessageKind, callback: F) -> SubscriptionHandle
    where
        F: FnMut(&ServerMessage) + Send + 'static,
    {
        self.register(kind, false, Box::new(callback))
    }

    /// Registers a handler that fires on the next message of `kind`, then
    /// removes itself.
    pub fn once<F>(&mut self, kind: ServerMessageKind, callback: F) -> SubscriptionHandle
    where
        F: FnMut(&ServerMessage) + Send + 'static,
    {
        self.register(kind, true, Box::new(callback))
    }

    /// Removes a subscription. Returns false when the handle is unknown,
    /// which includes `once` handlers that have already fired.
    pub fn off(&mut self, handle: SubscriptionHandle) -> bool {
        for registrations in self.subscribers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.handle != handle.0);
            if registrations.len() != before {
                return true;
            }
        }
        false
    }

    /// Delivers a message to every handler registered for its kind.
    pub fn emit(&mut self, message: &ServerMessage) {
        let kind = message.kind();
        let Some(registrations) = self.subscribers.get_mut(&kind) else {
            return;
        };
        registrations.retain_mut(|registration| {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.callback)(message)));
            if outcome.is_err() {
                warn!("Handler for {:?} panicked, removing it", kind);
                return false;
            }
            !registration.once
        });
    }

    fn register(
        &mut self,
        kind: ServerMessageKind,
        once: bool,
        callback: Callback,
    ) -> SubscriptionHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.subscribers.entry(kind).or_default().push(Registration {
            handle,
            once,
            callback,
        });
        SubscriptionHandle(handle)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pong() -> ServerMessage {
        ServerMessage::Pong {}
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let counter = Arc::new(AtomicUsize::new(0));
        let reader = Arc::clone(&counter);
        (counter, move || reader.load(Ordering::SeqCst))
    }

    #[test]
    fn test_on_fires_every_time() {
        let mut bus = EventBus::new();
        let (counter, count) = counter();
        bus.on(ServerMessageKind::Pong, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&pong());
        bus.emit(&pong());
        assert_eq!(count(), 2);
    }

    #[test]
    fn test_once_fires_once() {
        let mut bus = EventBus::new();
        let (counter, count) = counter();
        bus.once(ServerMessageKind::Pong, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&pong());
        bus.emit(&pong());
        assert_eq!(count(), 1);
    }

    #[test]
    fn test_off_removes_subscription() {
        let mut bus = EventBus::new();
        let (counter, count) = counter();
        let handle = bus.on(ServerMessageKind::Pong, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(handle));
        assert!(!bus.off(handle));
        bus.emit(&pong());
        assert_eq!(count(), 0);
    }

    #[test]
    fn test_handlers_are_kind_scoped() {
        let mut bus = EventBus::new();
        let (counter, count) = counter();
        bus.on(ServerMessageKind::SessionLeft, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&pong());
        assert_eq!(count(), 0);
        bus.emit(&ServerMessage::SessionLeft { success: true });
        assert_eq!(count(), 1);
    }

    #[test]
    fn test_panicking_handler_is_dropped_and_isolated() {
        let mut bus = EventBus::new();
        let (counter, count) = counter();
        bus.on(ServerMessageKind::Pong, |_| panic!("boom"));
        bus.on(ServerMessageKind::Pong, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&pong());
        bus.emit(&pong());
        // The survivor keeps firing, the panicker fired only once
        assert_eq!(count(), 2);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(ServerMessageKind::Pong, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        bus.emit(&pong());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_emit_without_subscribers_is_a_no_op() {
        let mut bus = EventBus::new();
        bus.emit(&pong());
    }

    #[test]
    fn test_handler_can_observe_payload() {
        let mut bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.on(ServerMessageKind::SessionError, move |message| {
            if let ServerMessage::SessionError { code, .. } = message {
                *sink.lock().unwrap() = Some(*code);
            }
        });

        bus.emit(&ServerMessage::SessionError {
            message: "nope".to_string(),
            code: shared::ErrorCode::NotAuthorized,
        });
        assert_eq!(*seen.lock().unwrap(), Some(shared::ErrorCode::NotAuthorized));
    }
}
