//! End-to-end behaviour of a bus handle over the simulated bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fwbus_core::protocol::{AVC_RESPONSE_ACCEPTED, AVC_RESPONSE_INTERIM};
use fwbus_core::{
    AddressRegion, BusConfig, BusEvent, DispatcherState, EventKind, FcpTransceiver, FwBus,
    FwError, InboundRequest, Outcome, Rcode, ResponderReply, SimBus, SimNode, Tcode,
    TransactionRequest,
};

const REMOTE: u16 = 0xFFC1;

fn config() -> BusConfig {
    BusConfig {
        trace_events: false,
        poll_interval_ms: 5,
        ..Default::default()
    }
}

fn running(sim: &Arc<SimBus>) -> FwBus {
    let bus = FwBus::new(sim.clone(), config()).unwrap();
    bus.start().unwrap();
    bus
}

/// Echo the command back as ACCEPTED.
fn accept(command: &[u8]) -> Vec<Vec<u8>> {
    let mut response = command.to_vec();
    response[0] = AVC_RESPONSE_ACCEPTED;
    vec![response]
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_generation_is_monotonic() {
    let sim = Arc::new(SimBus::new());
    let bus = running(&sim);
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = observed.clone();
        bus.subscribe(
            EventKind::BusReset,
            Arc::new(move |event: &BusEvent| {
                if let BusEvent::BusReset(snapshot) = event {
                    observed.lock().unwrap().push(snapshot.generation);
                }
            }),
        );
    }

    let mut last = bus.current_generation();
    for step in 0..10 {
        if step % 3 == 2 {
            sim.replay_bus_reset(last.saturating_sub(1));
        } else {
            sim.bus_reset();
        }
        thread::sleep(Duration::from_millis(10));
        let now = bus.current_generation();
        assert!(now >= last, "generation went from {last} to {now}");
        last = now;
    }
    bus.stop().unwrap();

    let observed = observed.lock().unwrap();
    assert!(observed.windows(2).all(|w| w[0] < w[1]), "{observed:?}");
    assert_eq!(bus.current_generation(), 1 + 7);
}

#[test]
fn test_transaction_timestamps_are_ordered() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(
        REMOTE,
        SimNode::new()
            .with_quadlet(0x1000, 0xDEAD_BEEF)
            .with_block(0x2000, &[0; 64]),
    );
    let bus = running(&sim);

    let requests = [
        TransactionRequest::read_quadlet(REMOTE, 0x1000),
        TransactionRequest::write_block(REMOTE, 0x2000, vec![0x5A; 64]),
        TransactionRequest::read_block(REMOTE, 0x2000, 64),
        TransactionRequest::compare_swap(REMOTE, 0x1000, 0xDEAD_BEEF, 1),
    ];
    for request in requests {
        let result = bus.engine().submit(request).unwrap();
        assert_eq!(result.outcome, Outcome::Complete);
        let ts = result.timestamps;
        let received = ts.received.unwrap();
        assert!(ts.initiate <= ts.sent && ts.sent <= received && received <= ts.finish, "{ts:?}");
    }
    assert_eq!(sim.node_memory(REMOTE, 0x1000, 4), Some(vec![0, 0, 0, 1]));
}

#[test]
fn test_exclusive_region_reservation() {
    let sim = Arc::new(SimBus::new());
    let bus = FwBus::new(sim.clone(), config()).unwrap();
    let ack = |_: &InboundRequest| Ok::<_, anyhow::Error>(ResponderReply::ack());

    bus.reserve(AddressRegion::new(0x100, 0x100), ack).unwrap();
    let err = bus.reserve(AddressRegion::new(0x150, 0x30), ack).unwrap_err();
    assert!(matches!(err, FwError::AddressConflict { .. }), "{err}");
    bus.reserve(AddressRegion::new(0x200, 0x100), ack).unwrap();
}

#[test]
fn test_timeout_fires() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().silent());
    let bus = running(&sim);

    let started = Instant::now();
    let err = bus
        .engine()
        .submit(TransactionRequest::read_quadlet(REMOTE, 0x400).with_timeout(Duration::from_millis(100)))
        .unwrap()
        .into_payload()
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, FwError::Timeout { timeout_ms: 100 }));
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(150), "{elapsed:?}");
}

#[test]
fn test_bus_reset_cancels_pending() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().silent());
    let bus = running(&sim);

    let (tx, rx) = mpsc::channel();
    bus.engine()
        .submit_with(
            TransactionRequest::read_quadlet(REMOTE, 0x400).with_timeout(Duration::from_secs(5)),
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();
    sim.bus_reset();

    let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(result.outcome, Outcome::BusReset);
    assert!(matches!(
        result.into_payload(),
        Err(FwError::BusReset { generation: 1 })
    ));
}

#[test]
fn test_single_outstanding_fcp_exchange() {
    let sim = Arc::new(SimBus::new());
    let hold = Arc::new(AtomicBool::new(true));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let resume_rx = Mutex::new(resume_rx);
    {
        let hold = hold.clone();
        sim.add_node(
            REMOTE,
            SimNode::new().with_fcp(move |command| {
                if hold.swap(false, Ordering::SeqCst) {
                    let _ = entered_tx.send(());
                    let _ = resume_rx.lock().unwrap().recv();
                }
                accept(command)
            }),
        );
    }
    let bus = running(&sim);
    let fcp = Arc::new(FcpTransceiver::new(&bus).unwrap());
    let command = [0x01, 0xFF, 0x19, 0x00, 0xFF, 0xFF];

    let first = {
        let fcp = fcp.clone();
        thread::spawn(move || fcp.transact(REMOTE, &command, None))
    };
    entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();

    let err = fcp.transact(REMOTE, &command, None).unwrap_err();
    assert!(matches!(err, FwError::Busy { node: REMOTE }), "{err}");

    resume_tx.send(()).unwrap();
    let response = first.join().unwrap().unwrap();
    assert_eq!(response.response_code(), AVC_RESPONSE_ACCEPTED);
    assert_eq!(&response.frame[1..command.len()], &command[1..]);

    let again = fcp.transact(REMOTE, &command, None).unwrap();
    assert_eq!(again.response_code(), AVC_RESPONSE_ACCEPTED);
    assert_eq!(fcp.pending_count(), 0);
}

#[test]
fn test_handler_failure_is_isolated() {
    let sim = Arc::new(SimBus::new());
    let bus = running(&sim);
    bus.reserve(
        AddressRegion::new(0x1000, 0x10),
        |req: &InboundRequest| -> anyhow::Result<ResponderReply> {
            panic!("handler bug at 0x{:X}", req.offset)
        },
    )
    .unwrap();
    bus.reserve(AddressRegion::new(0x2000, 0x10), |req: &InboundRequest| {
        Ok(ResponderReply::data(vec![0x11; req.length]))
    })
    .unwrap();

    let failing = sim.inject_request(0xFFC2, Tcode::WriteQuadletRequest, 0x1000, &[0; 4]);
    let healthy = sim.inject_read(0xFFC2, 0x2000, 4);

    let failed = sim.wait_response(failing, Duration::from_secs(1)).unwrap();
    assert_eq!(failed.rcode, Rcode::DataError);
    let served = sim.wait_response(healthy, Duration::from_secs(1)).unwrap();
    assert_eq!(served.rcode, Rcode::Complete);
    assert_eq!(served.payload, vec![0x11; 4]);
    assert_eq!(bus.dispatcher_state(), DispatcherState::Running);
}

#[test]
fn test_fcp_interim_then_final() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(
        REMOTE,
        SimNode::new().with_fcp(|command| {
            let mut interim = command.to_vec();
            interim[0] = AVC_RESPONSE_INTERIM;
            let mut last = accept(command);
            last.insert(0, interim);
            last
        }),
    );
    let bus = running(&sim);
    let fcp = FcpTransceiver::new(&bus).unwrap();

    let response = fcp.transact(REMOTE, &[0x00, 0x60, 0x02, 0x00, 0x01], None).unwrap();
    assert_eq!(response.interim.len(), 1);
    assert_eq!(response.response_code(), AVC_RESPONSE_ACCEPTED);
    // Five bytes were padded to a quadlet multiple on the wire.
    let sent = sim.sent_requests();
    assert_eq!(sent.last().unwrap().data.len(), 8);

    let ts = response.timestamps;
    let received = ts.received.unwrap();
    assert!(ts.initiate <= ts.sent && ts.sent <= received && received <= ts.finish, "{ts:?}");
}

#[test]
fn test_fcp_times_out_without_response() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().with_fcp(|_| Vec::new()));
    let bus = running(&sim);
    let fcp = FcpTransceiver::new(&bus).unwrap();

    let started = Instant::now();
    let err = fcp
        .transact(REMOTE, &[0x01, 0xFF, 0x19], Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, FwError::Timeout { timeout_ms: 50 }), "{err}");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_fcp_aborted_by_bus_reset() {
    let sim = Arc::new(SimBus::new());
    let (entered_tx, entered_rx) = mpsc::channel();
    sim.add_node(
        REMOTE,
        SimNode::new().with_fcp(move |_| {
            let _ = entered_tx.send(());
            Vec::new()
        }),
    );
    let bus = running(&sim);
    let fcp = Arc::new(FcpTransceiver::new(&bus).unwrap());

    let pending = {
        let fcp = fcp.clone();
        thread::spawn(move || fcp.transact(REMOTE, &[0x01, 0xFF, 0x19], Some(Duration::from_secs(5))))
    };
    entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    sim.bus_reset();

    let err = pending.join().unwrap().unwrap_err();
    assert!(matches!(err, FwError::BusReset { .. }), "{err}");
}

#[test]
fn test_fcp_frame_limits() {
    let sim = Arc::new(SimBus::new());
    let bus = running(&sim);
    let fcp = FcpTransceiver::new(&bus).unwrap();
    assert!(matches!(
        fcp.transact(REMOTE, &[0x01, 0xFF], None),
        Err(FwError::InvalidArgument(_))
    ));
    assert!(matches!(
        fcp.transact(REMOTE, &[0; 0x201], None),
        Err(FwError::InvalidArgument(_))
    ));
}

#[test]
fn test_disconnect_cancels_and_notifies() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().silent());
    let bus = running(&sim);
    let disconnected = Arc::new(AtomicBool::new(false));
    {
        let disconnected = disconnected.clone();
        bus.subscribe(
            EventKind::Disconnected,
            Arc::new(move |_: &BusEvent| disconnected.store(true, Ordering::SeqCst)),
        );
    }

    let (tx, rx) = mpsc::channel();
    bus.engine()
        .submit_with(
            TransactionRequest::read_quadlet(REMOTE, 0).with_timeout(Duration::from_secs(5)),
            move |result| {
                let _ = tx.send(result.outcome);
            },
        )
        .unwrap();
    sim.disconnect();

    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Cancelled);
    assert!(wait_until(|| disconnected.load(Ordering::SeqCst)));
    assert!(matches!(bus.clock().sample(), Err(FwError::ClockUnavailable(_))));
}

#[test]
fn test_blocking_call_from_observer_is_refused() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().with_quadlet(0, 0));
    let bus = running(&sim);
    let (tx, rx) = mpsc::channel();
    let engine = bus.engine().clone();
    bus.subscribe(
        EventKind::BusReset,
        Arc::new(move |_: &BusEvent| {
            let _ = tx.send(engine.read_quadlet(REMOTE, 0));
        }),
    );
    sim.bus_reset();
    let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(result, Err(FwError::WouldBlockDispatcher)));
}

#[test]
fn test_submit_after_stop_fails_fast() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, SimNode::new().with_quadlet(0, 7).with_fcp(accept));
    let bus = running(&sim);
    let fcp = FcpTransceiver::new(&bus).unwrap();
    bus.stop().unwrap();

    let started = Instant::now();
    assert!(matches!(
        bus.engine().submit(TransactionRequest::read_quadlet(REMOTE, 0)),
        Err(FwError::InvalidState { action: "submit", .. })
    ));
    assert!(matches!(
        fcp.transact(REMOTE, &[0x01, 0xFF, 0x30], None),
        Err(FwError::InvalidState { action: "submit", .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(bus.engine().pending_count(), 0);
    assert_eq!(fcp.pending_count(), 0);
    assert!(sim.sent_requests().is_empty());
}

#[test]
fn test_fcp_command_stays_in_its_generation() {
    let sim = Arc::new(SimBus::new());
    let commands = Arc::new(Mutex::new(0));
    {
        let commands = commands.clone();
        sim.add_node(
            REMOTE,
            SimNode::new().with_fcp(move |command| {
                *commands.lock().unwrap() += 1;
                accept(command)
            }),
        );
    }
    let bus = FwBus::new(sim.clone(), config()).unwrap();
    let fcp = FcpTransceiver::new(&bus).unwrap();

    // The controller is already in generation 2; the handle has not seen it.
    sim.bus_reset();
    let err = fcp
        .transact(REMOTE, &[0x01, 0xFF, 0x30], Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, FwError::Timeout { .. }), "{err}");
    assert_eq!(*commands.lock().unwrap(), 0);
    assert!(sim.sent_requests().iter().all(|r| r.generation == 1));

    bus.start().unwrap();
    assert!(wait_until(|| bus.current_generation() == 2));
    let response = fcp.transact(REMOTE, &[0x01, 0xFF, 0x30], None).unwrap();
    assert_eq!(response.response_code(), AVC_RESPONSE_ACCEPTED);
    assert_eq!(*commands.lock().unwrap(), 1);
    assert_eq!(sim.sent_requests().last().unwrap().generation, 2);
}

#[test]
fn test_fcp_timeout_covers_command_write() {
    let sim = Arc::new(SimBus::new());
    sim.add_node(
        REMOTE,
        SimNode::new().with_fcp(|_| {
            thread::sleep(Duration::from_millis(80));
            Vec::new()
        }),
    );
    let bus = running(&sim);
    let fcp = FcpTransceiver::new(&bus).unwrap();

    let started = Instant::now();
    let err = fcp
        .transact(REMOTE, &[0x01, 0xFF, 0x19], Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, FwError::Timeout { timeout_ms: 100 }), "{err}");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(95), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(170), "{elapsed:?}");
}
