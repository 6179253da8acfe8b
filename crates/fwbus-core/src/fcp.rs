//! FCP transceiver.
//!
//! Command frames are written to the target's FCP command register; the
//! target answers by writing a response frame into our FCP response
//! register. A response belongs to the pending exchange of the node that
//! wrote it when its subunit and opcode bytes match the command.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::bus::FwBus;
use crate::cycle_time::CycleClock;
use crate::dispatcher::{DispatcherState, on_dispatch_thread};
use crate::error::FwError;
use crate::events::{BusEvent, EventKind, HandlerRegistry, HandlerToken};
use crate::node::GenerationTracker;
use crate::protocol::constants::*;
use crate::protocol::Rcode;
use crate::responder::{AddressRegion, Responder, ResponderReply};
use crate::sync::{lock, wait_timeout};
use crate::transaction::{Outcome, TransactionEngine, TransactionRequest, TransactionTimestamps};
use crate::transport::InboundRequest;

/// Final response of an FCP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpResponse {
    /// Response frame as written by the target.
    pub frame: Vec<u8>,
    /// Interim frames received before the final one.
    pub interim: Vec<Vec<u8>>,
    /// `initiate` and `sent` of the command, `received` of the response.
    pub timestamps: TransactionTimestamps,
}

impl FcpResponse {
    /// AV/C response code of the final frame.
    pub fn response_code(&self) -> u8 {
        self.frame.first().map_or(0, |b| b & 0x0F)
    }
}

/// Check if an AV/C frame is an interim response.
pub fn is_interim(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b & 0x0F == AVC_RESPONSE_INTERIM)
}

struct Slot {
    subunit: u8,
    opcode: u8,
    interim: Vec<Vec<u8>>,
    extend: bool,
    response: Option<(Vec<u8>, Option<u16>)>,
    failure: Option<Outcome>,
}

#[derive(Default)]
struct Exchanges {
    slots: Mutex<HashMap<u16, Slot>>,
    arrived: Condvar,
}

impl Exchanges {
    fn on_response(&self, request: &InboundRequest) -> ResponderReply {
        if !request.tcode.is_write() {
            return ResponderReply::error(Rcode::TypeError);
        }
        if request.offset != FCP_RESPONSE_ADDR {
            return ResponderReply::error(Rcode::AddressError);
        }
        let frame = &request.payload;
        if frame.len() < FCP_MIN_FRAME_BYTES {
            debug!(len = frame.len(), "Runt FCP frame dropped");
            return ResponderReply::ack();
        }

        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(&request.source)
            .filter(|s| s.response.is_none() && s.failure.is_none())
            .filter(|s| s.subunit == frame[1] && s.opcode == frame[2]);
        match slot {
            Some(slot) if is_interim(frame) => {
                slot.interim.push(frame.clone());
                slot.extend = true;
            }
            Some(slot) => slot.response = Some((frame.clone(), request.tstamp)),
            None => {
                debug!(
                    source = %format!("{:04X}", request.source),
                    "Unmatched FCP response dropped"
                );
                return ResponderReply::ack();
            }
        }
        self.arrived.notify_all();
        ResponderReply::ack()
    }

    fn fail_all(&self, outcome: Outcome) {
        let mut slots = lock(&self.slots);
        let mut failed = 0;
        for slot in slots.values_mut().filter(|s| s.response.is_none()) {
            slot.failure.get_or_insert(outcome);
            failed += 1;
        }
        if failed > 0 {
            debug!(failed, outcome = %outcome, "FCP exchanges aborted");
            self.arrived.notify_all();
        }
    }
}

/// Removes the slot of an exchange however it ends.
struct SlotGuard<'a> {
    exchanges: &'a Exchanges,
    target: u16,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock(&self.exchanges.slots).remove(&self.target);
    }
}

/// FCP command/response exchanges with one exchange per target at a time.
pub struct FcpTransceiver {
    engine: Arc<TransactionEngine>,
    responder: Arc<Responder>,
    clock: Arc<CycleClock>,
    tracker: Arc<GenerationTracker>,
    registry: Arc<HandlerRegistry>,
    exchanges: Arc<Exchanges>,
    region: AddressRegion,
    tokens: Vec<HandlerToken>,
    timeout: Duration,
    interim_timeout: Duration,
}

impl FcpTransceiver {
    /// Reserve the local FCP response register of `bus` and listen on it.
    pub fn new(bus: &FwBus) -> Result<Self, FwError> {
        let exchanges = Arc::new(Exchanges::default());
        let responder = Arc::clone(bus.responder());
        let region = {
            let exchanges = Arc::clone(&exchanges);
            responder.reserve(
                AddressRegion::new(FCP_RESPONSE_ADDR, FCP_MAX_FRAME_BYTES as u64),
                move |request: &InboundRequest| Ok(exchanges.on_response(request)),
            )?
        };

        let registry = Arc::clone(bus.registry());
        let watch = |kind, outcome_of: fn(&BusEvent) -> Option<Outcome>| {
            let exchanges = Arc::clone(&exchanges);
            registry.register(
                kind,
                Arc::new(move |event: &BusEvent| {
                    if let Some(outcome) = outcome_of(event) {
                        exchanges.fail_all(outcome);
                    }
                }),
            )
        };
        let tokens = vec![
            watch(EventKind::BusReset, |_| Some(Outcome::BusReset)),
            watch(EventKind::Disconnected, |_| Some(Outcome::Cancelled)),
            watch(EventKind::StateChanged, |event| match event {
                BusEvent::StateChanged {
                    to: DispatcherState::Stopping | DispatcherState::Stopped,
                    ..
                } => Some(Outcome::Cancelled),
                _ => None,
            }),
        ];

        let config = bus.config();
        info!("FCP listener bound");
        Ok(Self {
            engine: Arc::clone(bus.engine()),
            responder,
            clock: Arc::clone(bus.clock()),
            tracker: Arc::clone(bus.tracker()),
            registry,
            exchanges,
            region,
            tokens,
            timeout: Duration::from_millis(config.fcp_timeout_ms),
            interim_timeout: Duration::from_millis(config.fcp_interim_timeout_ms),
        })
    }

    /// Send `frame` to `target` and wait for its response frame.
    ///
    /// `timeout` bounds the whole exchange, command write included; it
    /// defaults to the configured FCP window. An INTERIM response restarts
    /// the wait with the interim window. A second call for a target with an
    /// exchange in progress fails with `Busy`. The command is only sent in
    /// the generation current at the call.
    #[instrument(skip(self, target, frame), fields(
        target = %format!("{:04X}", target),
        len = frame.len(),
    ))]
    pub fn transact(
        &self,
        target: u16,
        frame: &[u8],
        timeout: Option<Duration>,
    ) -> Result<FcpResponse, FwError> {
        if on_dispatch_thread() {
            return Err(FwError::WouldBlockDispatcher);
        }
        if !(FCP_MIN_FRAME_BYTES..=FCP_MAX_FRAME_BYTES).contains(&frame.len()) {
            return Err(FwError::InvalidArgument(format!(
                "FCP frame of {} bytes",
                frame.len()
            )));
        }
        let timeout = timeout.unwrap_or(self.timeout);
        let generation = self.tracker.current_generation();

        {
            let mut slots = lock(&self.exchanges.slots);
            if slots.contains_key(&target) {
                return Err(FwError::Busy { node: target });
            }
            slots.insert(
                target,
                Slot {
                    subunit: frame[1],
                    opcode: frame[2],
                    interim: Vec::new(),
                    extend: false,
                    response: None,
                    failure: None,
                },
            );
        }
        let _guard = SlotGuard {
            exchanges: &self.exchanges,
            target,
        };

        let aborted = lock(&self.exchanges.slots)
            .get(&target)
            .and_then(|slot| slot.failure);
        if let Some(outcome) = aborted {
            return Err(FwError::from_outcome(outcome, timeout.as_millis() as u64, generation)
                .unwrap_or(FwError::Cancelled));
        }
        if !self.tracker.is_current(generation) {
            return Err(FwError::BusReset {
                generation: self.tracker.current_generation(),
            });
        }

        let started = Instant::now();
        let mut padded = frame.to_vec();
        padded.resize(frame.len().div_ceil(QUADLET_SIZE) * QUADLET_SIZE, 0);
        let command = self.engine.submit(
            TransactionRequest::write_block(target, FCP_COMMAND_ADDR, padded)
                .with_timeout(timeout)
                .with_generation(generation),
        )?;
        let command_timestamps = command.timestamps;
        command.into_payload()?;

        let mut deadline = started + timeout;
        let mut slots = lock(&self.exchanges.slots);
        let (frame, interim, tstamp) = loop {
            let Some(slot) = slots.get_mut(&target) else {
                return Err(FwError::Cancelled);
            };
            if let Some(outcome) = slot.failure {
                return Err(FwError::from_outcome(outcome, timeout.as_millis() as u64, generation)
                    .unwrap_or(FwError::Cancelled));
            }
            if let Some((frame, tstamp)) = slot.response.take() {
                break (frame, std::mem::take(&mut slot.interim), tstamp);
            }
            if std::mem::take(&mut slot.extend) {
                debug!("Interim response, extending wait");
                deadline = Instant::now() + self.interim_timeout;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(timeout_ms = timeout.as_millis() as u64, "FCP response timed out");
                return Err(FwError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            slots = wait_timeout(&self.exchanges.arrived, slots, deadline - now);
        };
        drop(slots);

        let finish = self.clock.sample_or_last();
        let received = tstamp
            .and_then(|t| self.clock.convert(t).ok())
            .unwrap_or(finish);
        Ok(FcpResponse {
            frame,
            interim,
            timestamps: TransactionTimestamps {
                initiate: command_timestamps.initiate,
                sent: command_timestamps.sent,
                received: Some(received),
                finish,
            },
        })
    }

    /// Number of exchanges in progress.
    pub fn pending_count(&self) -> usize {
        lock(&self.exchanges.slots).len()
    }
}

impl Drop for FcpTransceiver {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            self.registry.unregister(token);
        }
        self.exchanges.fail_all(Outcome::Cancelled);
        if let Err(e) = self.responder.release(self.region) {
            debug!(error = %e, "FCP register already released");
        }
    }
}
