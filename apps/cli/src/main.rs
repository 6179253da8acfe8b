use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fwbus_core::{BusConfig, ConfigRom, FwCharDevice, FwError};
use tracing::{error, info};

mod demo;

#[derive(Parser, Debug)]
#[command(author, version, about = "FireWire bus transaction tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML bus configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe a FireWire character device (/dev/fw*)
    Inspect {
        /// Path to the character device
        path: PathBuf,
    },
    /// Run a scripted session against the simulated bus
    Demo,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            BusConfig::load_from_file(path)?
        }
        None => BusConfig::default(),
    };

    match &args.command {
        Command::Inspect { path } => inspect(path),
        Command::Demo => demo::run(config),
    }
}

fn inspect(path: &PathBuf) -> Result<()> {
    let device = FwCharDevice::probe(path).map_err(FwError::from)?;
    println!("device: {}", device.name());
    match device.guid() {
        Some(guid) => println!("guid: {guid:016x}"),
        None => println!("guid: unknown"),
    }
    match device.config_rom() {
        Some(rom) => print_rom(&rom),
        None => println!("config rom: unavailable"),
    }
    Ok(())
}

pub(crate) fn print_rom(rom: &ConfigRom) {
    println!("config rom:");
    for (i, quadlet) in rom.quadlets().iter().enumerate() {
        println!("  [{:02}] {:08x}", i, quadlet);
    }
    println!(
        "  bus-info crc: {}",
        if rom.verify_bus_info_crc() { "ok" } else { "mismatch" }
    );
}
