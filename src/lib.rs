//! # Logic Device RS
//!
//! Host-side driver interface for USB logic analyzers.
//!
//! The library tracks which analyzers are plugged in, hands out a typed handle
//! per connected device, and streams captured samples from the device (or
//! output samples to it) on a worker thread per stream.
//!
//! ## Features
//!
//! - **Connection management**: Discovery runs on a dispatch thread, and
//!   connect/disconnect observers receive a `DeviceHandle` per device
//! - **Streaming state machine**: Each device is idle, reading or writing, and
//!   illegal transitions are rejected instead of ignored
//! - **Capability-typed handles**: Single-byte I/O is only reachable on
//!   single-channel devices, and channel selection only on multi-channel ones
//! - **Owned buffers**: Captured chunks are moved into the consumer, so a
//!   buffer cannot be released twice
//! - **DataFrame output**: Uses `polars` to turn captured bytes into per-channel columns
//! - **Simulated hardware**: `SimulatedBus` and `SimulatedDevice` stand in for the USB stack
//!
//! ## Examples
//!
//! ### Watching for Devices
//!
//! ```rust
//! use logic_device_rs::{ConnectionManager, DeviceClass, SimulatedBus, SimulatedDevice};
//! use std::time::Duration;
//!
//! let bus = SimulatedBus::new();
//! bus.plug("usb-1-2", SimulatedDevice::new(DeviceClass::MultiChannel).shared());
//!
//! let manager = ConnectionManager::new(bus.clone())?;
//! let (tx, rx) = crossbeam_channel::unbounded();
//! manager.register_on_connect(move |id, handle| {
//!     println!("Device {} connected: {}", id, handle.class());
//!     let _ = tx.send(handle);
//! });
//! manager.begin_discovery();
//!
//! let handle = rx.recv_timeout(Duration::from_secs(5))?;
//! assert_eq!(handle.channel_count(), 16);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Capturing Samples
//!
//! ```rust
//! use logic_device_rs::{ConnectionManager, DeviceClass, SimulatedBus, SimulatedDevice};
//! use std::time::Duration;
//!
//! let bus = SimulatedBus::new();
//! bus.plug("usb-1-2", SimulatedDevice::new(DeviceClass::MultiChannel).shared());
//! let manager = ConnectionManager::new(bus.clone())?;
//! let (tx, rx) = crossbeam_channel::unbounded();
//! manager.register_on_connect(move |_, handle| {
//!     let _ = tx.send(handle);
//! });
//! manager.begin_discovery();
//! let handle = rx.recv_timeout(Duration::from_secs(5))?;
//!
//! let analyzer = handle.as_multi_channel()?;
//! analyzer.set_active_channels(&[0, 1, 2, 3])?;
//! analyzer.set_sample_rate_hz(1_000_000)?;
//!
//! let (data_tx, data_rx) = crossbeam_channel::unbounded();
//! analyzer.register_on_read_data(move |_, buffer| {
//!     let _ = data_tx.send(buffer);
//! })?;
//! analyzer.read_start()?;
//! let buffer = data_rx.recv_timeout(Duration::from_secs(5))?;
//! analyzer.stop()?;
//!
//! let layout = analyzer.sample_layout()?;
//! let frame = logic_device_rs::to_data_frame(&buffer, &layout, 1_000_000)?;
//! println!("{}", frame.head(Some(4)));
//! manager.release_buffer(buffer)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod capture_config;
pub mod capture_frame;
pub mod connection_manager;
pub mod device_events;
pub mod device_handle;
pub mod simulated_device;
pub mod square_wave;
pub mod streaming;
pub mod transport;

// Re-export the main types for convenience
pub use connection_manager::{ConnectionManager, ConnectionManagerError, ManagerOptions};

pub use device_handle::{
    DeviceError, DeviceHandle, DeviceId, DeviceVariant, MultiChannelHandle, SingleChannelHandle,
};

pub use streaming::StreamingState;

pub use buffer::{BufferError, BufferLedger, ReadBuffer};

pub use capture_config::{ActiveChannels, CaptureSettings, ConfigError, DeviceClass, SampleRates};

pub use transport::{DeviceDiscovery, DiscoveredDevice, PhysicalKey, Transport, TransportError};

pub use device_events::{DeviceEvent, EventMask};

pub use simulated_device::{SignalPattern, SimulatedBus, SimulatedDevice};

pub use capture_frame::{to_data_frame, SampleLayout};

pub use square_wave::SquareWaveAnalyzer;
