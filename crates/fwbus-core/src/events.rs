//! Event system for handler registration.
//!
//! Lets applications (CLI, GUI, sound-unit drivers) subscribe to bus events
//! without tight coupling to the core logic. Observers are keyed by event
//! kind and invoked on the dispatcher thread. The one exception is the
//! `Idle -> Stopped` change of a dispatcher that never started, which is
//! reported on the thread that stopped it.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::dispatcher::DispatcherState;
use crate::node::NodeSnapshot;
use crate::protocol::{Rcode, Tcode};
use crate::sync::lock;
use crate::transaction::{Outcome, TransactionId, TransactionTimestamps};

/// Events delivered by the dispatcher.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The bus was reset; carries the new topology.
    BusReset(Arc<NodeSnapshot>),
    /// Another node addressed a reserved region.
    RequestReceived {
        tcode: Tcode,
        offset: u64,
        source: u16,
        length: usize,
        rcode: Rcode,
    },
    /// An outbound transaction finished.
    TransactionComplete {
        id: TransactionId,
        tcode: Tcode,
        destination: u16,
        offset: u64,
        outcome: Outcome,
        timestamps: TransactionTimestamps,
    },
    /// Dispatcher lifecycle transition.
    StateChanged {
        from: DispatcherState,
        to: DispatcherState,
    },
    /// The controller was removed.
    Disconnected,
}

/// Discriminant of `BusEvent`, used as registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BusReset,
    RequestReceived,
    TransactionComplete,
    StateChanged,
    Disconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::BusReset,
        EventKind::RequestReceived,
        EventKind::TransactionComplete,
        EventKind::StateChanged,
        EventKind::Disconnected,
    ];
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::BusReset(_) => EventKind::BusReset,
            BusEvent::RequestReceived { .. } => EventKind::RequestReceived,
            BusEvent::TransactionComplete { .. } => EventKind::TransactionComplete,
            BusEvent::StateChanged { .. } => EventKind::StateChanged,
            BusEvent::Disconnected => EventKind::Disconnected,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::BusReset => write!(f, "bus-reset"),
            EventKind::RequestReceived => write!(f, "request-received"),
            EventKind::TransactionComplete => write!(f, "transaction-complete"),
            EventKind::StateChanged => write!(f, "state-changed"),
            EventKind::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Observer trait for receiving bus events.
///
/// Implement this trait in your application layer to receive updates.
pub trait BusObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BusEvent);
}

impl<F> BusObserver for F
where
    F: Fn(&BusEvent) + Send + Sync,
{
    fn on_event(&self, event: &BusEvent) {
        self(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BusObserver for NullObserver {
    fn on_event(&self, _event: &BusEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BusObserver for TracingObserver {
    fn on_event(&self, event: &BusEvent) {
        match event {
            BusEvent::BusReset(snapshot) => {
                tracing::info!(
                    generation = snapshot.generation,
                    node_id = %format!("{:04X}", snapshot.node_id),
                    root = %format!("{:04X}", snapshot.root_node_id),
                    "Bus reset"
                );
            }
            BusEvent::RequestReceived {
                tcode,
                offset,
                source,
                length,
                rcode,
            } => {
                tracing::debug!(
                    tcode = %tcode,
                    offset = %format!("0x{:012X}", offset),
                    source = %format!("{:04X}", source),
                    len = length,
                    rcode = %rcode,
                    "Request received"
                );
            }
            BusEvent::TransactionComplete {
                id,
                tcode,
                destination,
                offset,
                outcome,
                timestamps,
            } => {
                if *outcome == Outcome::Complete {
                    tracing::debug!(
                        id = id.0,
                        tcode = %tcode,
                        dest = %format!("{:04X}", destination),
                        offset = %format!("0x{:012X}", offset),
                        sent = %timestamps.sent,
                        finish = %timestamps.finish,
                        "Transaction complete"
                    );
                } else {
                    tracing::warn!(
                        id = id.0,
                        tcode = %tcode,
                        dest = %format!("{:04X}", destination),
                        offset = %format!("0x{:012X}", offset),
                        outcome = %outcome,
                        "Transaction failed"
                    );
                }
            }
            BusEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Dispatcher state changed");
            }
            BusEvent::Disconnected => {
                tracing::warn!("Controller disconnected");
            }
        }
    }
}

/// Events raised off the dispatcher thread, held until its next turn.
#[derive(Default)]
pub(crate) struct Outbox {
    queue: Mutex<VecDeque<BusEvent>>,
}

impl Outbox {
    pub(crate) fn push(&self, event: BusEvent) {
        lock(&self.queue).push_back(event);
    }

    pub(crate) fn drain(&self) -> Vec<BusEvent> {
        lock(&self.queue).drain(..).collect()
    }
}

/// Opaque registration token returned by `HandlerRegistry::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

struct Registration {
    token: HandlerToken,
    kind: EventKind,
    observer: Arc<dyn BusObserver>,
    removed: AtomicBool,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Arc<Registration>>,
    next_token: u64,
    /// Nesting depth of running `dispatch` calls.
    dispatching: usize,
    /// Entries were marked removed during a dispatch.
    dirty: bool,
}

/// Observers keyed by event kind, in registration order.
///
/// Unregistering while a dispatch is running only marks the entry; the list
/// is compacted once no dispatch is in progress.
#[derive(Default)]
pub struct HandlerRegistry {
    state: Mutex<RegistryState>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, observer: Arc<dyn BusObserver>) -> HandlerToken {
        let mut state = lock(&self.state);
        state.next_token += 1;
        let token = HandlerToken(state.next_token);
        state.entries.push(Arc::new(Registration {
            token,
            kind,
            observer,
            removed: AtomicBool::new(false),
        }));
        debug!(kind = %kind, token = token.0, "Handler registered");
        token
    }

    /// Returns `false` if the token is unknown or already removed.
    pub fn unregister(&self, token: HandlerToken) -> bool {
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.iter().find(|e| e.token == token) else {
            return false;
        };
        if entry.removed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if state.dispatching == 0 {
            state.entries.retain(|e| e.token != token);
        } else {
            state.dirty = true;
        }
        debug!(token = token.0, "Handler unregistered");
        true
    }

    /// Number of live registrations for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.state)
            .entries
            .iter()
            .filter(|e| e.kind == kind && !e.removed.load(Ordering::SeqCst))
            .count()
    }

    /// Deliver `event` to every live observer of its kind.
    ///
    /// A panicking observer is logged and skipped.
    pub fn dispatch(&self, event: &BusEvent) {
        let kind = event.kind();
        let targets: Vec<Arc<Registration>> = {
            let mut state = lock(&self.state);
            state.dispatching += 1;
            state
                .entries
                .iter()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect()
        };

        for entry in targets {
            if entry.removed.load(Ordering::SeqCst) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| entry.observer.on_event(event)));
            if result.is_err() {
                error!(kind = %kind, token = entry.token.0, "Observer panicked");
            }
        }

        let mut state = lock(&self.state);
        state.dispatching -= 1;
        if state.dispatching == 0 && state.dirty {
            state.entries.retain(|e| !e.removed.load(Ordering::SeqCst));
            state.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn disconnected() -> BusEvent {
        BusEvent::Disconnected
    }

    #[test]
    fn test_dispatch_by_kind_in_order() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            registry.register(
                EventKind::Disconnected,
                Arc::new(move |_: &BusEvent| seen.lock().unwrap().push(tag)),
            );
        }
        let other = Arc::clone(&seen);
        registry.register(
            EventKind::BusReset,
            Arc::new(move |_: &BusEvent| other.lock().unwrap().push("reset")),
        );

        registry.dispatch(&disconnected());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = registry.register(
            EventKind::Disconnected,
            Arc::new(move |_: &BusEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.dispatch(&disconnected());
        assert!(registry.unregister(token));
        assert!(!registry.unregister(token));
        registry.dispatch(&disconnected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(EventKind::Disconnected), 0);
    }

    #[test]
    fn test_unregister_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let second_token = Arc::new(Mutex::new(None));

        {
            let registry2 = Arc::clone(&registry);
            let second_token = Arc::clone(&second_token);
            registry.register(
                EventKind::Disconnected,
                Arc::new(move |_: &BusEvent| {
                    if let Some(token) = second_token.lock().unwrap().take() {
                        registry2.unregister(token);
                    }
                }),
            );
        }
        let counter = Arc::clone(&hits);
        let token = registry.register(
            EventKind::Disconnected,
            Arc::new(move |_: &BusEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        *second_token.lock().unwrap() = Some(token);

        // The first observer removes the second before it runs.
        registry.dispatch(&disconnected());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.count(EventKind::Disconnected), 1);
        assert_eq!(lock(&registry.state).entries.len(), 1);
    }

    struct FailingObserver;

    impl BusObserver for FailingObserver {
        fn on_event(&self, _event: &BusEvent) {
            panic!("observer failure");
        }
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::Disconnected, Arc::new(FailingObserver));
        let counter = Arc::clone(&hits);
        registry.register(
            EventKind::Disconnected,
            Arc::new(move |_: &BusEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.dispatch(&disconnected());
        registry.dispatch(&disconnected());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_kind() {
        let event = BusEvent::StateChanged {
            from: DispatcherState::Idle,
            to: DispatcherState::Running,
        };
        assert_eq!(event.kind(), EventKind::StateChanged);
        assert_eq!(EventKind::ALL.len(), 5);
        TracingObserver.on_event(&event);
        NullObserver.on_event(&event);
    }
}
