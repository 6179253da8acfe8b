//! Scripted session against the simulated bus.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use fwbus_core::protocol::{
    AVC_RESPONSE_IMPLEMENTED_STABLE, CSR_CONFIG_ROM, QUADLET_SIZE,
};
use fwbus_core::{
    AddressRegion, BusConfig, BusEvent, ConfigRom, EventKind, FcpTransceiver, FwBus,
    InboundRequest, ResponderReply, SimBus, SimNode, Tcode, TransactionRequest,
    TransactionTimestamps,
};
use tracing::info;

const REMOTE: u16 = 0xFFC1;
const REMOTE_GUID: u64 = 0x0013_0E04_0101_2345;
const MAILBOX: u64 = 0xFFFF_E000_0000;

/// Remote AV/C unit: a config ROM and UNIT INFO support over FCP.
fn remote_node() -> SimNode {
    let rom = ConfigRom::synthesize(REMOTE_GUID, 0x00_130E, 0x00_0004);
    SimNode::new()
        .with_block(CSR_CONFIG_ROM, &rom.to_bytes())
        .with_fcp(|command| {
            let mut response = command.to_vec();
            response[0] = AVC_RESPONSE_IMPLEMENTED_STABLE;
            // UNIT INFO operands: 0x07, unit type audio, company ID.
            if response.len() >= 8 && response[2] == 0x30 {
                response[3..8].copy_from_slice(&[0x07, 0x08 << 3, 0x00, 0x13, 0x0E]);
            }
            vec![response]
        })
}

pub fn run(config: BusConfig) -> Result<()> {
    let sim = Arc::new(SimBus::new());
    sim.add_node(REMOTE, remote_node());

    let bus = FwBus::new(sim.clone(), config)?;
    bus.subscribe(
        EventKind::BusReset,
        Arc::new(|event: &BusEvent| {
            if let BusEvent::BusReset(snapshot) = event {
                println!("bus-reset: generation {}", snapshot.generation);
            }
        }),
    );

    let snapshot = bus.snapshot();
    println!("node id:     {:04x}", snapshot.node_id);
    println!("local:       {:04x}", snapshot.local_node_id);
    println!("root:        {:04x}", snapshot.root_node_id);
    println!("bus manager: {:04x}", snapshot.bus_manager_node_id);
    println!("ir manager:  {:04x}", snapshot.ir_manager_node_id);
    println!("generation:  {}", snapshot.generation);
    crate::print_rom(&snapshot.config_rom()?);

    let mailbox = bus.reserve(AddressRegion::new(MAILBOX, 0x100), |req: &InboundRequest| {
        println!(
            "request: {} from {:04x} at {:012x}",
            req.tcode, req.source, req.offset
        );
        hexdump(&req.payload);
        Ok(ResponderReply::ack())
    })?;
    bus.start()?;

    let handle = sim.inject_request(REMOTE, Tcode::WriteBlockRequest, MAILBOX, b"hello, 1394 world");
    let response = sim
        .wait_response(handle, Duration::from_secs(1))
        .context("no response to inbound request")?;
    println!("response: {}", response.rcode);

    let result = bus
        .engine()
        .submit(TransactionRequest::read_quadlet(REMOTE, CSR_CONFIG_ROM + QUADLET_SIZE as u64))?;
    let timestamps = result.timestamps;
    let bus_name = result.quadlet()?;
    println!("read {:04x}:{:012x} = {:08x}", REMOTE, CSR_CONFIG_ROM + 4, bus_name);
    print_timestamps(&timestamps);

    let fcp = FcpTransceiver::new(&bus)?;
    let unit_info = [0x01, 0xFF, 0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
    let exchange = fcp.transact(REMOTE, &unit_info, None)?;
    print!("fcp response:");
    for byte in &exchange.frame {
        print!(" {byte:02x}");
    }
    println!();
    print_timestamps(&exchange.timestamps);
    drop(fcp);

    sim.bus_reset();
    sim.bus_reset();
    thread::sleep(Duration::from_millis(50));

    bus.release(mailbox)?;
    bus.stop()?;
    info!(generation = bus.current_generation(), "Demo finished");
    Ok(())
}

fn print_timestamps(ts: &TransactionTimestamps) {
    println!("  initiate: {}", ts.initiate);
    println!("  sent:     {}", ts.sent);
    match ts.received {
        Some(received) => println!("  received: {received}"),
        None => println!("  received: -"),
    }
    println!("  finish:   {}", ts.finish);
}

fn hexdump(data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("  {:04x}  {:<47}  {}", i * 16, hex.join(" "), ascii);
    }
}
