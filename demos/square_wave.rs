// Square wave measurement example
//
// Streams from a simulated single-channel analyzer that sees a square wave
// and reports its frequency and duty cycle as the chunks come in.

use clap::Parser;
use logic_device_rs::{
    ConnectionManager, DeviceClass, SignalPattern, SimulatedBus, SimulatedDevice,
    SquareWaveAnalyzer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "square_wave")]
#[command(version = "0.1")]
#[command(about = "Measure a square wave on a simulated logic analyzer")]
struct Args {
    /// Samples per period of the simulated wave
    #[arg(short, long, default_value_t = 40)]
    period: u32,

    /// Samples per period the wave is high
    #[arg(long, default_value_t = 10)]
    high: u32,

    /// Input to measure
    #[arg(short, long, default_value_t = 0)]
    channel: u8,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 4_000_000)]
    rate: u32,

    /// Number of chunks to analyze
    #[arg(short = 'n', long, default_value_t = 20)]
    chunks: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();

    println!("Square Wave Analyzer");
    println!("====================\n");

    let bus = SimulatedBus::new();
    bus.plug(
        "usb-3-1",
        SimulatedDevice::new(DeviceClass::SingleChannel)
            .with_pattern(SignalPattern::Square {
                period: args.period,
                high: args.high,
            })
            .with_chunk_limit(args.chunks)
            .shared(),
    );

    let manager = ConnectionManager::new(bus.clone())?;
    let (connected_tx, connected) = crossbeam_channel::bounded(1);
    manager.register_on_connect(move |_, handle| {
        let _ = connected_tx.try_send(handle);
    });
    manager.begin_discovery();
    let device = connected.recv_timeout(Duration::from_secs(2))?;

    device.set_sample_rate_hz(args.rate)?;
    let analyzer = Arc::new(Mutex::new(SquareWaveAnalyzer::new(
        args.channel,
        device.sample_layout()?,
        args.rate,
    )?));

    let (done_tx, done) = crossbeam_channel::unbounded();
    let chunks = args.chunks;
    let shared = Arc::clone(&analyzer);
    device.register_on_read_data(move |_, buffer| {
        let Ok(mut analyzer) = shared.lock() else {
            return;
        };
        analyzer.process(&buffer);
        if let Some(frequency) = analyzer.frequency_hz() {
            println!(
                "chunk {:>3}: {:>10.1} Hz, duty cycle {:>5.1}%",
                buffer.sequence(),
                frequency,
                analyzer.duty_cycle().unwrap_or_default() * 100.0
            );
        }
        if buffer.sequence() + 1 == chunks {
            let _ = done_tx.send(());
        }
    })?;

    device.read_start()?;
    let finished = done.recv_timeout(Duration::from_secs(5));
    device.stop()?;
    finished?;

    let analyzer = analyzer.lock().map_err(|_| "analyzer lock poisoned")?;
    println!("\nSamples analyzed: {}", analyzer.samples_seen());
    match (analyzer.frequency_hz(), analyzer.period_s(), analyzer.duty_cycle()) {
        (Some(frequency), Some(period), Some(duty)) => {
            println!("Frequency:  {:.1} Hz", frequency);
            println!("Period:     {:.3} µs", period * 1e6);
            println!("Duty cycle: {:.1}%", duty * 100.0);
        }
        _ => println!("Not enough edges seen on channel {}", args.channel),
    }

    Ok(())
}
