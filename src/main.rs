use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{error, info, LevelFilter};
use syslog::Facility;

use door_agent::gpio::PiLines;
use door_agent::mqtt::MqttBus;
use door_agent::{Config, Error, Scheduler};

/// Monitors and operates garage doors over GPIO and publishes their state to MQTT.
#[derive(Parser)]
#[command(name = "door-agent", version)]
struct Args {
    /// Main configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// Log every sensor sample and MQTT message
    #[arg(long, short)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if let Err(err) = syslog::init(Facility::LOG_DAEMON, level, Some("door-agent")) {
        eprintln!("Unable to connect to syslog: {}", err);
    }

    if let Err(err) = run(&args) {
        error!("main: {}", err);
        eprintln!("door-agent: {}", err);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    info!("main: loading {}", args.config.display());
    let config = Config::load(&args.config)?;

    // Doors are still created without GPIO so their faults show up on the bus.
    let lines = PiLines::new();
    if let Err(err) = &lines {
        error!("Unable to set up GPIO: {}", err);
    }
    let now = Instant::now();
    let registry = config.build_registry(lines.as_ref().ok(), now)?;
    info!("main: {} door(s) configured", registry.len());

    let mut bus = MqttBus::new(&config.mqtt, registry.iter().map(|door| door.index()));
    let mut scheduler = Scheduler::new(registry, config.cadence, now);
    scheduler.run(&mut bus, &term);

    info!("main: exiting");
    Ok(())
}
