//! Bus handle.
//!
//! `FwBus` ties the components of one local controller together: it owns
//! the dispatcher, and its core routes every transport event to the
//! generation tracker, transaction engine or responder before observers see
//! it.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::cycle_time::CycleClock;
use crate::dispatcher::{Dispatcher, DispatcherState, EventSink};
use crate::error::FwError;
use crate::events::{
    BusEvent, BusObserver, EventKind, HandlerRegistry, HandlerToken, Outbox, TracingObserver,
};
use crate::node::{GenerationTracker, NodeSnapshot};
use crate::responder::{AddressRegion, Responder, ResponderReply};
use crate::transaction::{Outcome, TransactionEngine};
use crate::transport::{BusTransport, InboundRequest, TransportEvent};

struct BusCore {
    tracker: Arc<GenerationTracker>,
    engine: Arc<TransactionEngine>,
    responder: Arc<Responder>,
    registry: Arc<HandlerRegistry>,
    outbox: Arc<Outbox>,
}

impl BusCore {
    /// Publish events raised by the engine and responder.
    fn flush(&self) {
        for event in self.outbox.drain() {
            self.registry.dispatch(&event);
        }
    }
}

impl EventSink for BusCore {
    fn deliver(&self, event: TransportEvent) {
        match event {
            TransportEvent::BusReset(snapshot) => {
                if let Some(installed) = self.tracker.on_bus_reset(snapshot) {
                    self.engine.fail_stale(installed.generation);
                    self.flush();
                    self.registry.dispatch(&BusEvent::BusReset(installed));
                }
            }
            TransportEvent::Response {
                closure,
                rcode,
                payload,
                request_tstamp,
                response_tstamp,
            } => self
                .engine
                .complete(closure, rcode, payload, request_tstamp, response_tstamp),
            TransportEvent::Request(request) => self.responder.handle_inbound(request),
            TransportEvent::Disconnected => {
                warn!("Controller disconnected");
                self.engine.fail_all(Outcome::Cancelled);
                self.flush();
                self.registry.dispatch(&BusEvent::Disconnected);
            }
        }
        self.flush();
    }

    fn tick(&self, now: Instant) {
        self.engine.expire(now);
        self.flush();
    }

    fn state_changed(&self, from: DispatcherState, to: DispatcherState) {
        self.registry.dispatch(&BusEvent::StateChanged { from, to });
    }

    fn shutdown(&self) {
        self.engine.close();
        let cancelled = self.engine.fail_all(Outcome::Cancelled);
        if cancelled > 0 {
            debug!(cancelled, "Pending transactions cancelled");
        }
        self.flush();
    }
}

/// Handle to one local FireWire controller.
pub struct FwBus {
    config: BusConfig,
    clock: Arc<CycleClock>,
    core: Arc<BusCore>,
    dispatcher: Dispatcher,
}

impl FwBus {
    /// Bind to `transport` in the generation it currently reports.
    ///
    /// The dispatcher is not started.
    pub fn new(transport: Arc<dyn BusTransport>, config: BusConfig) -> Result<Self, FwError> {
        let snapshot = transport.node_info()?;
        let tracker = Arc::new(GenerationTracker::new(snapshot));
        let clock = Arc::new(CycleClock::new(Arc::clone(&transport)));
        let outbox = Arc::new(Outbox::default());
        let engine = Arc::new(TransactionEngine::new(
            Arc::clone(&transport),
            Arc::clone(&tracker),
            Arc::clone(&clock),
            Arc::clone(&outbox),
            config.transaction_timeout(),
        ));
        let responder = Arc::new(Responder::new(Arc::clone(&transport), Arc::clone(&outbox)));
        let registry = Arc::new(HandlerRegistry::new());
        if config.trace_events {
            for kind in EventKind::ALL {
                registry.register(kind, Arc::new(TracingObserver));
            }
        }

        let core = Arc::new(BusCore {
            tracker,
            engine,
            responder,
            registry,
            outbox,
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::clone(&core) as Arc<dyn EventSink>,
            config.poll_interval(),
        );
        Ok(Self {
            config,
            clock,
            core,
            dispatcher,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Start event delivery.
    pub fn start(&self) -> Result<(), FwError> {
        self.dispatcher.start()
    }

    /// Stop event delivery; pending transactions fail with `Cancelled`.
    pub fn stop(&self) -> Result<(), FwError> {
        self.dispatcher.stop()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Topology and generation as of the last bus reset.
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.core.tracker.snapshot()
    }

    pub fn current_generation(&self) -> u32 {
        self.core.tracker.current_generation()
    }

    /// Register `observer` for events of `kind`.
    pub fn subscribe(&self, kind: EventKind, observer: Arc<dyn BusObserver>) -> HandlerToken {
        self.core.registry.register(kind, observer)
    }

    pub fn unsubscribe(&self, token: HandlerToken) -> bool {
        self.core.registry.unregister(token)
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.core.engine
    }

    pub fn responder(&self) -> &Arc<Responder> {
        &self.core.responder
    }

    pub fn clock(&self) -> &Arc<CycleClock> {
        &self.clock
    }

    pub fn tracker(&self) -> &Arc<GenerationTracker> {
        &self.core.tracker
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.core.registry
    }

    /// Shorthand for `responder().reserve`.
    pub fn reserve<F>(&self, region: AddressRegion, handler: F) -> Result<AddressRegion, FwError>
    where
        F: Fn(&InboundRequest) -> anyhow::Result<ResponderReply> + Send + Sync + 'static,
    {
        self.core.responder.reserve(region, handler)
    }

    /// Shorthand for `responder().release`.
    pub fn release(&self, region: AddressRegion) -> Result<(), FwError> {
        self.core.responder.release(region)
    }
}

impl Drop for FwBus {
    fn drop(&mut self) {
        if let Err(e) = self.dispatcher.stop() {
            warn!(error = %e, "Dispatcher stop failed");
        }
        self.core.responder.release_all();
        info!("Bus handle closed");
    }
}
