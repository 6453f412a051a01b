// Streaming capture example
//
// Connects to a simulated 16-channel analyzer, captures for a while and
// prints the result as a DataFrame.

use clap::Parser;
use logic_device_rs::{
    to_data_frame, ConnectionManager, DeviceClass, ReadBuffer, SignalPattern, SimulatedBus,
    SimulatedDevice,
};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "stream_capture")]
#[command(version = "0.1")]
#[command(about = "Capture samples from a simulated multi-channel logic analyzer")]
struct Args {
    /// Channels to capture, in bit order
    #[arg(short, long, value_delimiter = ',', default_values_t = vec![0u8, 1, 2, 3])]
    channels: Vec<u8>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    rate: u32,

    /// Capture duration in milliseconds
    #[arg(short, long, default_value_t = 50)]
    duration: u64,

    /// Capture a square wave instead of a byte counter
    #[arg(short, long)]
    square: bool,

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

    println!("Logic Analyzer Stream Capture");
    println!("=============================\n");

    let pattern = if args.square {
        SignalPattern::Square { period: 8, high: 3 }
    } else {
        SignalPattern::Counter
    };
    let bus = SimulatedBus::new();
    bus.plug(
        "usb-2-1",
        SimulatedDevice::new(DeviceClass::MultiChannel)
            .with_pattern(pattern)
            .shared(),
    );

    let manager = ConnectionManager::new(bus.clone())?;
    let (connected_tx, connected) = crossbeam_channel::bounded(1);
    manager.register_on_connect(move |_, handle| {
        let _ = connected_tx.try_send(handle);
    });
    manager.begin_discovery();

    let handle = connected.recv_timeout(Duration::from_secs(2))?;
    let analyzer = handle.as_multi_channel()?;
    println!("✓ Connected to device {} at {}", analyzer.id(), analyzer.physical_key());

    let rates = analyzer.supported_sample_rates()?;
    println!("Supported sample rates: {:?}", rates.to_vec());
    analyzer.set_sample_rate_hz(args.rate)?;
    analyzer.set_active_channels(&args.channels)?;
    println!("Capturing channels {:?} at {} Hz\n", args.channels, args.rate);

    let (data_tx, data) = crossbeam_channel::unbounded();
    analyzer.register_on_read_data(move |_, buffer| {
        let _ = data_tx.send(buffer);
    })?;
    analyzer.register_on_error(|id, error| {
        eprintln!("Device {} stopped streaming: {}", id, error);
    })?;

    let start = Instant::now();
    analyzer.read_start()?;
    std::thread::sleep(Duration::from_millis(args.duration));
    analyzer.stop()?;
    let elapsed = start.elapsed();

    let buffers: Vec<ReadBuffer> = data.try_iter().collect();
    let mut captured = Vec::new();
    for buffer in buffers {
        captured.extend_from_slice(&buffer);
        manager.release_buffer(buffer)?;
    }

    let layout = analyzer.sample_layout()?;
    println!(
        "Captured {} bytes ({} samples) in {:.1} ms",
        captured.len(),
        layout.sample_count(captured.len()),
        elapsed.as_secs_f64() * 1000.0
    );
    println!(
        "Buffers delivered: {}, released: {}, outstanding: {}\n",
        manager.buffers().delivered(),
        manager.buffers().released(),
        manager.buffers().outstanding()
    );

    let frame = to_data_frame(&captured, &layout, args.rate)?;
    println!("{}", frame.head(Some(10)));

    Ok(())
}
