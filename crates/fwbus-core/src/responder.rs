//! Address-space responder.
//!
//! Regions of local address space are reserved exclusively and bound to a
//! handler. Inbound requests are routed to the handler whose region contains
//! them; requests outside every region are answered with an address error.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::on_dispatch_thread;
use crate::error::FwError;
use crate::events::{BusEvent, Outbox};
use crate::protocol::{OFFSET_SPACE_END, Rcode};
use crate::sync::{lock, wait};
use crate::transport::{BusTransport, InboundRequest};

/// A reserved range `[start, start + length)` of local address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRegion {
    pub start: u64,
    pub length: u64,
}

impl AddressRegion {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn overlaps(&self, other: &AddressRegion) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Response code and payload a handler answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderReply {
    pub rcode: Rcode,
    pub payload: Vec<u8>,
}

impl ResponderReply {
    /// Successful completion carrying read data.
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            rcode: Rcode::Complete,
            payload,
        }
    }

    /// Successful completion without data.
    pub fn ack() -> Self {
        Self::data(Vec::new())
    }

    pub fn error(rcode: Rcode) -> Self {
        Self {
            rcode,
            payload: Vec::new(),
        }
    }
}

/// Handler bound to a reserved region.
///
/// Runs on the dispatcher thread and holds up further delivery until it
/// returns. An `Err` or a panic is answered with a data error.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &InboundRequest) -> anyhow::Result<ResponderReply>;
}

impl<F> RequestHandler for F
where
    F: Fn(&InboundRequest) -> anyhow::Result<ResponderReply> + Send + Sync,
{
    fn handle(&self, request: &InboundRequest) -> anyhow::Result<ResponderReply> {
        self(request)
    }
}

struct RegionEntry {
    region: AddressRegion,
    handler: Arc<dyn RequestHandler>,
    in_flight: usize,
    releasing: bool,
}

/// Exclusive reservations and their handlers.
pub struct Responder {
    transport: Arc<dyn BusTransport>,
    outbox: Arc<Outbox>,
    regions: Mutex<BTreeMap<u64, RegionEntry>>,
    released: Condvar,
}

impl Responder {
    pub(crate) fn new(transport: Arc<dyn BusTransport>, outbox: Arc<Outbox>) -> Self {
        Self {
            transport,
            outbox,
            regions: Mutex::new(BTreeMap::new()),
            released: Condvar::new(),
        }
    }

    /// Reserve `region` and bind `handler` to it.
    ///
    /// Overlap with an existing reservation, including one being released,
    /// fails with `AddressConflict` before the transport is touched.
    pub fn reserve<F>(&self, region: AddressRegion, handler: F) -> Result<AddressRegion, FwError>
    where
        F: Fn(&InboundRequest) -> anyhow::Result<ResponderReply> + Send + Sync + 'static,
    {
        self.reserve_handler(region, Arc::new(handler))
    }

    /// Like `reserve`, for handlers implemented as types.
    #[instrument(skip(self, handler), fields(
        start = %format!("0x{:012X}", region.start),
        length = region.length,
    ))]
    pub fn reserve_handler(
        &self,
        region: AddressRegion,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<AddressRegion, FwError> {
        if region.length == 0 || region.start.saturating_add(region.length) > OFFSET_SPACE_END {
            return Err(FwError::InvalidArgument(format!(
                "region 0x{:012X}+0x{:X} outside 48-bit space",
                region.start, region.length
            )));
        }

        let mut regions = lock(&self.regions);
        if let Some(existing) = regions.values().find(|e| e.region.overlaps(&region)) {
            return Err(FwError::AddressConflict {
                start: region.start,
                end: region.end(),
                existing_start: existing.region.start,
                existing_end: existing.region.end(),
            });
        }
        self.transport.allocate(region.start, region.length)?;
        regions.insert(
            region.start,
            RegionEntry {
                region,
                handler,
                in_flight: 0,
                releasing: false,
            },
        );
        info!("Region reserved");
        Ok(region)
    }

    /// Release a reservation.
    ///
    /// New requests are refused immediately. The underlying allocation is
    /// removed once in-flight handler calls have returned; this waits for
    /// them unless called from the dispatcher thread, where it defers.
    #[instrument(skip(self), fields(start = %format!("0x{:012X}", region.start)))]
    pub fn release(&self, region: AddressRegion) -> Result<(), FwError> {
        let mut regions = lock(&self.regions);
        let entry = match regions.get_mut(&region.start) {
            Some(entry) if entry.region == region && !entry.releasing => entry,
            _ => return Err(FwError::RegionNotReserved { start: region.start }),
        };
        entry.releasing = true;

        if entry.in_flight == 0 {
            regions.remove(&region.start);
            drop(regions);
            return self.deallocate(region);
        }
        if on_dispatch_thread() {
            debug!("Release deferred until handler returns");
            return Ok(());
        }
        while regions.contains_key(&region.start) {
            regions = wait(&self.released, regions);
        }
        Ok(())
    }

    /// Release every reservation.
    pub(crate) fn release_all(&self) {
        let all: Vec<AddressRegion> = lock(&self.regions)
            .values()
            .filter(|e| !e.releasing)
            .map(|e| e.region)
            .collect();
        for region in all {
            if let Err(e) = self.release(region) {
                warn!(error = %e, "Release failed");
            }
        }
    }

    /// Currently reserved regions, in address order.
    pub fn regions(&self) -> Vec<AddressRegion> {
        lock(&self.regions)
            .values()
            .filter(|e| !e.releasing)
            .map(|e| e.region)
            .collect()
    }

    pub fn is_reserved(&self, offset: u64) -> bool {
        self.regions()
            .iter()
            .any(|r| offset >= r.start && offset < r.end())
    }

    /// Route one inbound request and answer it.
    pub(crate) fn handle_inbound(&self, request: InboundRequest) {
        let target = {
            let mut regions = lock(&self.regions);
            let found = regions
                .range_mut(..=request.offset)
                .next_back()
                .map(|(_, e)| e)
                .filter(|e| {
                    !e.releasing && request.within(e.region.start, e.region.end())
                });
            found.map(|entry| {
                entry.in_flight += 1;
                (entry.region, Arc::clone(&entry.handler))
            })
        };

        let reply = match &target {
            None => {
                debug!(
                    offset = %format!("0x{:012X}", request.offset),
                    source = %format!("{:04X}", request.source),
                    "Request outside reserved regions"
                );
                ResponderReply::error(Rcode::AddressError)
            }
            Some((_, handler)) => invoke(handler.as_ref(), &request),
        };

        let payload: &[u8] = if reply.rcode == Rcode::Complete && request.tcode.has_response_payload() {
            &reply.payload
        } else {
            &[]
        };
        if let Err(e) = self
            .transport
            .send_response(request.handle, reply.rcode, payload)
        {
            warn!(handle = request.handle, error = %e, "Send response failed");
        }

        if let Some((region, _)) = target {
            self.finish(region);
        }

        self.outbox.push(BusEvent::RequestReceived {
            tcode: request.tcode,
            offset: request.offset,
            source: request.source,
            length: request.length,
            rcode: reply.rcode,
        });
    }

    fn finish(&self, region: AddressRegion) {
        let mut regions = lock(&self.regions);
        let Some(entry) = regions.get_mut(&region.start) else {
            return;
        };
        entry.in_flight -= 1;
        if entry.releasing && entry.in_flight == 0 {
            regions.remove(&region.start);
            drop(regions);
            if let Err(e) = self.deallocate(region) {
                warn!(error = %e, "Deferred release failed");
            }
            self.released.notify_all();
        }
    }

    fn deallocate(&self, region: AddressRegion) -> Result<(), FwError> {
        self.transport.deallocate(region.start)?;
        info!(start = %format!("0x{:012X}", region.start), "Region released");
        Ok(())
    }
}

fn invoke(handler: &dyn RequestHandler, request: &InboundRequest) -> ResponderReply {
    let reply = match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!(
                offset = %format!("0x{:012X}", request.offset),
                error = %e,
                "Handler failed"
            );
            return ResponderReply::error(Rcode::DataError);
        }
        Err(_) => {
            error!(offset = %format!("0x{:012X}", request.offset), "Handler panicked");
            return ResponderReply::error(Rcode::DataError);
        }
    };

    if !reply.rcode.is_wire_code() {
        warn!(rcode = %reply.rcode, "Handler answered with a local-only code");
        return ResponderReply::error(Rcode::DataError);
    }
    if reply.rcode == Rcode::Complete
        && request.tcode.has_response_payload()
        && reply.payload.len() != request.length
    {
        warn!(
            expected = request.length,
            actual = reply.payload.len(),
            "Handler returned wrong payload size"
        );
        return ResponderReply::error(Rcode::DataError);
    }
    reply
}
