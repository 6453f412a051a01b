// Device watch example
//
// Plugs and unplugs simulated analyzers and prints every connect and
// disconnect the connection manager reports.

use clap::Parser;
use logic_device_rs::{
    ConnectionManager, DeviceClass, DeviceEvent, EventMask, SimulatedBus, SimulatedDevice,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "device_watch")]
#[command(version = "0.1")]
#[command(about = "Watch simulated logic analyzers come and go")]
struct Args {
    /// Number of simulated devices on the bus
    #[arg(short, long, default_value_t = 3)]
    devices: usize,

    /// Plug/unplug rounds
    #[arg(short, long, default_value_t = 2)]
    cycles: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("Logic Analyzer Device Watch");
    println!("===========================\n");

    let bus = SimulatedBus::new();
    let manager = ConnectionManager::new(bus.clone())?;
    let events = manager.subscribe(EventMask::CONNECT | EventMask::DISCONNECT);

    manager.register_on_connect(|id, handle| {
        println!(
            "✓ Device {} connected at {}: {} ({} channels, {})",
            id,
            handle.physical_key(),
            handle.class(),
            handle.channel_count(),
            if handle.is_usb2() { "USB 2.0" } else { "USB 1.1" }
        );
    });
    manager.register_on_disconnect(|id| {
        println!("✗ Device {} disconnected", id);
    });
    manager.register_on_discovery_error(|error| {
        eprintln!("Discovery failed: {}", error);
    });

    let keys: Vec<String> = (0..args.devices).map(|i| format!("usb-1-{}", i + 1)).collect();

    for cycle in 0..args.cycles {
        println!("\nRound {}: plugging {} devices", cycle + 1, keys.len());
        for (i, key) in keys.iter().enumerate() {
            let class = if i % 2 == 0 {
                DeviceClass::MultiChannel
            } else {
                DeviceClass::SingleChannel
            };
            bus.plug(key, SimulatedDevice::new(class).with_usb2(i % 3 != 2).shared());
        }
        manager.begin_discovery();
        wait_for(&events, keys.len());
        println!("  {} devices connected", manager.devices().len());

        println!("\nRound {}: unplugging every other device", cycle + 1);
        let unplugged: Vec<&String> = keys.iter().step_by(2).collect();
        for key in &unplugged {
            bus.unplug(key);
        }
        manager.begin_discovery();
        wait_for(&events, unplugged.len());

        for handle in manager.devices() {
            println!("  still connected: device {} at {}", handle.id(), handle.physical_key());
        }

        let remaining: Vec<&String> = keys.iter().skip(1).step_by(2).collect();
        for key in &remaining {
            bus.unplug(key);
        }
        manager.begin_discovery();
        wait_for(&events, remaining.len());
    }

    println!("\nShutting down");
    drop(manager);
    Ok(())
}

/// Block until `count` connect/disconnect events arrived or a second passed
fn wait_for(events: &crossbeam_channel::Receiver<DeviceEvent>, count: usize) {
    for _ in 0..count {
        if events.recv_timeout(Duration::from_secs(1)).is_err() {
            eprintln!("Timed out waiting for device events");
            return;
        }
    }
}
