//! Event dispatcher.
//!
//! Owns the single worker thread of a bus handle. The worker pulls events
//! from the transport and hands them, strictly one at a time and in arrival
//! order, to the bus core.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::FwError;
use crate::sync::{lock, wait};
use crate::transport::{BusTransport, TransportError, TransportEvent};

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Running => "running",
            DispatcherState::Stopping => "stopping",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

thread_local! {
    static DISPATCH_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Check if the caller runs on a dispatcher worker.
pub(crate) fn on_dispatch_thread() -> bool {
    DISPATCH_THREAD.with(Cell::get)
}

/// Receiver of everything the worker produces.
pub(crate) trait EventSink: Send + Sync {
    fn deliver(&self, event: TransportEvent);

    /// Called after every wait, with or without an event.
    fn tick(&self, now: Instant);

    fn state_changed(&self, from: DispatcherState, to: DispatcherState);

    /// Resolve everything still pending; last call before `Stopped`.
    fn shutdown(&self);
}

struct Shared {
    state: Mutex<DispatcherState>,
    changed: Condvar,
    /// Transport event count when `Stopping` was entered.
    stop_mark: Mutex<Option<u64>>,
}

impl Shared {
    fn set(&self, state: DispatcherState) {
        *lock(&self.state) = state;
        self.changed.notify_all();
    }

    fn get(&self) -> DispatcherState {
        *lock(&self.state)
    }

    /// Check if the event that brought the taken count to `taken` was
    /// queued before stop was requested.
    fn accepts(&self, taken: u64) -> bool {
        let mark = *lock(&self.stop_mark);
        mark.is_none_or(|mark| taken <= mark)
    }
}

/// Single-threaded event loop of one bus handle.
pub struct Dispatcher {
    transport: Arc<dyn BusTransport>,
    sink: Arc<dyn EventSink>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        transport: Arc<dyn BusTransport>,
        sink: Arc<dyn EventSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            sink,
            shared: Arc::new(Shared {
                state: Mutex::new(DispatcherState::Idle),
                changed: Condvar::new(),
                stop_mark: Mutex::new(None),
            }),
            worker: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.get()
    }

    /// Start delivering events. Only valid once, from `Idle`.
    pub fn start(&self) -> Result<(), FwError> {
        {
            let mut state = lock(&self.shared.state);
            if *state != DispatcherState::Idle {
                return Err(FwError::InvalidState {
                    state: *state,
                    action: "start",
                });
            }
            *state = DispatcherState::Running;
        }

        let transport = Arc::clone(&self.transport);
        let sink = Arc::clone(&self.sink);
        let shared = Arc::clone(&self.shared);
        let poll_interval = self.poll_interval;
        let spawned = thread::Builder::new()
            .name("fwbus-dispatch".into())
            .spawn(move || run(transport.as_ref(), sink.as_ref(), &shared, poll_interval));

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                info!("Dispatcher started");
                Ok(())
            }
            Err(e) => {
                self.shared.set(DispatcherState::Idle);
                Err(FwError::Transport(TransportError::Io(e)))
            }
        }
    }

    /// Stop delivering events.
    ///
    /// Events queued before the call are delivered, later ones are dropped,
    /// then every pending operation is resolved. Blocks until the worker has
    /// exited, except when called from the worker itself, where it only
    /// requests the shutdown.
    ///
    /// A dispatcher stopped from `Idle` has no worker; its `Idle -> Stopped`
    /// notification runs on the calling thread.
    pub fn stop(&self) -> Result<(), FwError> {
        let previous = {
            let mut state = lock(&self.shared.state);
            let previous = *state;
            match previous {
                DispatcherState::Idle => *state = DispatcherState::Stopped,
                DispatcherState::Running => {
                    *lock(&self.shared.stop_mark) = Some(self.transport.events_queued());
                    *state = DispatcherState::Stopping;
                }
                DispatcherState::Stopping | DispatcherState::Stopped => {}
            }
            previous
        };

        if previous == DispatcherState::Idle {
            self.sink.shutdown();
            self.sink
                .state_changed(DispatcherState::Idle, DispatcherState::Stopped);
            return Ok(());
        }
        if on_dispatch_thread() {
            debug!("Stop requested from the dispatcher thread");
            return Ok(());
        }

        let handle = lock(&self.worker).take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Dispatcher worker panicked");
                    self.shared.set(DispatcherState::Stopped);
                }
            }
            None => {
                // Another caller is joining; wait for it to finish.
                let mut state = lock(&self.shared.state);
                while *state != DispatcherState::Stopped {
                    state = wait(&self.shared.changed, state);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Dispatcher stop failed");
        }
    }
}

fn run(
    transport: &dyn BusTransport,
    sink: &dyn EventSink,
    shared: &Shared,
    poll_interval: Duration,
) {
    DISPATCH_THREAD.with(|flag| flag.set(true));
    sink.state_changed(DispatcherState::Idle, DispatcherState::Running);

    let mut dropped = 0usize;
    while shared.get() == DispatcherState::Running {
        match transport.next_event(poll_interval) {
            Ok(Some(event)) => {
                if shared.accepts(transport.events_taken()) {
                    sink.deliver(event);
                } else {
                    dropped += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Event wait failed");
                thread::sleep(poll_interval);
            }
        }
        sink.tick(Instant::now());
    }

    sink.state_changed(DispatcherState::Running, DispatcherState::Stopping);
    let mark = (*lock(&shared.stop_mark)).unwrap_or(0);
    let mut drained = 0usize;
    while transport.events_taken() < mark {
        match transport.next_event(Duration::ZERO) {
            Ok(Some(event)) if shared.accepts(transport.events_taken()) => {
                sink.deliver(event);
                drained += 1;
            }
            Ok(Some(_)) => dropped += 1,
            Ok(None) | Err(_) => break,
        }
    }
    sink.tick(Instant::now());
    sink.shutdown();
    sink.state_changed(DispatcherState::Stopping, DispatcherState::Stopped);
    shared.set(DispatcherState::Stopped);
    if dropped > 0 {
        debug!(dropped, "Events after stop dropped");
    }
    info!(drained, "Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimBus;
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        dispatcher: OnceLock<Arc<Dispatcher>>,
        stop_on_reset: bool,
        /// Queues one more reset right after the first stop request.
        reset_after_stop: OnceLock<Arc<SimBus>>,
        worker_threads: Mutex<Vec<bool>>,
    }

    impl Recorder {
        fn log(&self) -> Vec<String> {
            lock(&self.log).clone()
        }
    }

    impl EventSink for Recorder {
        fn deliver(&self, event: TransportEvent) {
            assert!(on_dispatch_thread());
            let entry = match event {
                TransportEvent::BusReset(snap) => format!("reset {}", snap.generation),
                TransportEvent::Request(req) => format!("request {:X}", req.offset),
                TransportEvent::Response { closure, .. } => format!("response {closure}"),
                TransportEvent::Disconnected => "disconnected".into(),
            };
            lock(&self.log).push(entry);
            if self.stop_on_reset {
                if let Some(dispatcher) = self.dispatcher.get() {
                    let first = dispatcher.state() == DispatcherState::Running;
                    dispatcher.stop().unwrap();
                    if let (true, Some(bus)) = (first, self.reset_after_stop.get()) {
                        bus.bus_reset();
                    }
                }
            }
        }

        fn tick(&self, _now: Instant) {}

        fn state_changed(&self, from: DispatcherState, to: DispatcherState) {
            lock(&self.worker_threads).push(on_dispatch_thread());
            lock(&self.log).push(format!("{from}->{to}"));
        }

        fn shutdown(&self) {
            lock(&self.log).push("shutdown".into());
        }
    }

    fn setup(stop_on_reset: bool) -> (Arc<SimBus>, Arc<Recorder>, Arc<Dispatcher>) {
        let bus = Arc::new(SimBus::new());
        let recorder = Arc::new(Recorder {
            stop_on_reset,
            ..Default::default()
        });
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            recorder.clone(),
            Duration::from_millis(5),
        ));
        let _ = recorder.dispatcher.set(dispatcher.clone());
        (bus, recorder, dispatcher)
    }

    #[test]
    fn test_lifecycle_and_ordering() {
        let (bus, recorder, dispatcher) = setup(false);
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
        bus.bus_reset();
        bus.inject_request(0xFFC1, crate::protocol::Tcode::WriteQuadletRequest, 0x40, &[0; 4]);
        bus.bus_reset();

        dispatcher.start().unwrap();
        assert!(matches!(
            dispatcher.start(),
            Err(FwError::InvalidState {
                state: DispatcherState::Running,
                ..
            })
        ));
        dispatcher.stop().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        dispatcher.stop().unwrap();

        assert_eq!(
            recorder.log(),
            vec![
                "idle->running",
                "reset 2",
                "request 40",
                "reset 3",
                "running->stopping",
                "shutdown",
                "stopping->stopped",
            ]
        );
        assert!(matches!(
            dispatcher.start(),
            Err(FwError::InvalidState {
                state: DispatcherState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn test_stop_drains_queued_events() {
        let (bus, recorder, dispatcher) = setup(false);
        dispatcher.start().unwrap();
        for _ in 0..20 {
            bus.bus_reset();
        }
        dispatcher.stop().unwrap();
        let resets = recorder
            .log()
            .iter()
            .filter(|e| e.starts_with("reset"))
            .count();
        assert_eq!(resets, 20);
    }

    #[test]
    fn test_events_after_stop_are_not_delivered() {
        let (bus, recorder, dispatcher) = setup(true);
        let _ = recorder.reset_after_stop.set(bus.clone());
        bus.bus_reset();
        bus.bus_reset();
        dispatcher.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while dispatcher.state() != DispatcherState::Stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            recorder.log(),
            vec![
                "idle->running",
                "reset 2",
                "running->stopping",
                "reset 3",
                "shutdown",
                "stopping->stopped",
            ]
        );
        // Reset 4 arrived after the stop request and stays undelivered.
        assert_eq!(bus.events_queued(), 3);
    }

    #[test]
    fn test_drain_ends_against_busy_transport() {
        let (bus, recorder, dispatcher) = setup(false);
        dispatcher.start().unwrap();
        let producing = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let producer = {
            let bus = bus.clone();
            let producing = producing.clone();
            thread::spawn(move || {
                while producing.load(std::sync::atomic::Ordering::SeqCst) {
                    bus.bus_reset();
                    thread::sleep(Duration::from_micros(50));
                }
            })
        };
        thread::sleep(Duration::from_millis(20));

        dispatcher.stop().unwrap();
        let delivered = recorder
            .log()
            .iter()
            .filter(|e| e.starts_with("reset"))
            .count() as u64;
        let at_stop = bus.events_queued();
        while bus.events_queued() == at_stop {
            thread::sleep(Duration::from_millis(1));
        }
        producing.store(false, std::sync::atomic::Ordering::SeqCst);
        producer.join().unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(delivered < bus.events_queued());
    }

    #[test]
    fn test_stop_from_worker_does_not_deadlock() {
        let (bus, recorder, dispatcher) = setup(true);
        dispatcher.start().unwrap();
        bus.bus_reset();

        let deadline = Instant::now() + Duration::from_secs(2);
        while dispatcher.state() != DispatcherState::Stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        dispatcher.stop().unwrap();
        assert!(recorder.log().contains(&"shutdown".to_string()));
    }

    #[test]
    fn test_stop_without_start() {
        let (_bus, recorder, dispatcher) = setup(false);
        dispatcher.stop().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(recorder.log(), vec!["shutdown", "idle->stopped"]);
        assert_eq!(*lock(&recorder.worker_threads), vec![false]);
    }

    #[test]
    fn test_state_changes_reported_on_worker() {
        let (_bus, recorder, dispatcher) = setup(false);
        dispatcher.start().unwrap();
        dispatcher.stop().unwrap();
        assert_eq!(*lock(&recorder.worker_threads), vec![true; 3]);
    }
}
