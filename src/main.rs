//! Line-oriented scale client.
//!
//! Prints the live device list and scale events to stdout and takes
//! commands from stdin:
//!
//!   <n>  connect to device number n
//!   b    read battery level
//!   d    disconnect and resume scanning
//!   l    list visible devices
//!   q    quit

use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use scale_rs::cli::{Cli, LogSettings};
use scale_rs::prelude::*;
use scale_rs::{logging, sim};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help / --version are not failures.
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    let log = LogSettings::from_env(&cli);
    logging::init(&log).context("could not create log file")?;

    // ── Adapter ───────────────────────────────────────────────────────────────
    if cli.simulate {
        let adapter = SimAdapter::new();
        let _demo = sim::spawn_demo(&adapter);
        client(Arc::new(adapter), &cli).await
    } else {
        let adapter = BtleplugAdapter::new()
            .await
            .context("Bluetooth is not available")?;
        client(Arc::new(adapter), &cli).await
    }
}

fn print_devices(devices: &[TrackedDevice]) {
    if devices.is_empty() {
        println!("[DEVICES] none in range");
        return;
    }
    println!("[DEVICES]");
    for (i, d) in devices.iter().enumerate() {
        let rssi = d
            .advertisement
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "-".into());
        let addr = d.advertisement.usable_address().unwrap_or("(no address)");
        println!(
            "  {:2}. {:24} {:18} {rssi:8}  {}",
            i + 1,
            d.name(),
            addr,
            manufacturer_name(&d.advertisement)
        );
    }
}

fn print_event(event: &ScaleEvent) {
    match event {
        ScaleEvent::Connecting => println!("[SCALE] connecting…"),
        ScaleEvent::Connected(name) => println!("[SCALE] connected to {name}"),
        ScaleEvent::Weight(w) => {
            println!("[WEIGHT] {:8.1} g  {:7.3} kg  raw={:02x?}", w.grams, w.kg, w.raw)
        }
        ScaleEvent::Battery(b) => println!("[BATTERY] {}%", b.level),
        ScaleEvent::Disconnected => println!("[SCALE] disconnected"),
        ScaleEvent::Error(e) => println!("[SCALE] error: {e}"),
    }
}

async fn resume_scanning<A: Adapter>(discovery: &DiscoverySession<A>) {
    if discovery.state() != ScanState::Stopped {
        return;
    }
    match discovery.start().await {
        Ok(()) => println!("[SCAN] scanning…"),
        Err(e) => error!("Could not restart discovery: {e}"),
    }
}

async fn client<A: Adapter>(adapter: Arc<A>, cli: &Cli) -> Result<()> {
    let discovery = DiscoverySession::new(
        Arc::clone(&adapter),
        DiscoveryConfig {
            presence_window: cli.presence_window(),
            ..Default::default()
        },
    );
    let scale = ConnectionSession::new(adapter, ConnectionConfig::default());
    let mut found = discovery.subscribe();
    let mut events = scale.subscribe();

    discovery.start().await?;
    println!(
        "Scanning for scales (window {:.1} s). Commands: <n> connect · b battery · d disconnect · l list · q quit",
        discovery.config().presence_window.as_secs_f64()
    );

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (a StdinLock is not Send) and
    // relayed to the async loop.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line.trim().to_owned()).is_err() {
                break;
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    let mut devices: Vec<TrackedDevice> = vec![];
    loop {
        tokio::select! {
            Some(event) = found.recv() => match event {
                DiscoveryEvent::Discovered(d) => {
                    println!("[FOUND] {}  [{}]", d.name(), d.identity);
                }
                DiscoveryEvent::Updated(list) => {
                    let changed = list.len() != devices.len()
                        || list.iter().zip(&devices).any(|(a, b)| a.identity != b.identity);
                    devices = list;
                    if changed {
                        print_devices(&devices);
                    }
                }
            },

            Some(event) = events.recv() => {
                print_event(&event);
                if matches!(event, ScaleEvent::Disconnected | ScaleEvent::Error(_)) {
                    resume_scanning(&discovery).await;
                }
            }

            line = line_rx.recv() => {
                let Some(line) = line else {
                    info!("stdin closed");
                    break;
                };
                match line.as_str() {
                    "" => {}
                    "q" => break,
                    "l" => print_devices(&devices),
                    "b" => {
                        if let Err(e) = scale.read_battery().await {
                            println!("[BATTERY] {e}");
                        }
                    }
                    "d" => {
                        scale.disconnect().await;
                        resume_scanning(&discovery).await;
                    }
                    cmd => match cmd.parse::<usize>().ok().and_then(|n| devices.get(n.wrapping_sub(1))) {
                        Some(device) => {
                            let device = device.clone();
                            discovery.stop().await;
                            devices.clear();
                            if let Err(e) = scale.connect(&device).await {
                                error!("Connect failed: {e}");
                            }
                        }
                        None => println!("Unknown command or device number: '{cmd}'"),
                    },
                }
            }
        }
    }

    info!("Shutting down");
    scale.disconnect().await;
    discovery.stop().await;
    Ok(())
}
