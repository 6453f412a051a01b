//! Seams towards the hardware side.
//!
//! The USB transport and the firmware protocol live behind these traits. A
//! `DeviceDiscovery` enumerates physical units, each one reachable through a
//! `Transport`. `simulated_device` provides an in-process implementation.

use crate::capture_config::{CaptureSettings, DeviceClass};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Hardware fault: {0}")]
    Hardware(String),

    #[error("Failed to allocate a {len} byte transfer buffer")]
    BufferAllocation { len: usize },

    #[error("Timeout waiting for the device")]
    Timeout,

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
}

impl TransportError {
    /// Whether the physical link is gone, as opposed to a recoverable fault
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}

/// Connection to one physical device.
///
/// Calls may come from the consumer's thread (configuration, single-byte
/// I/O) and from a streaming worker at the same time.
pub trait Transport: Send + Sync {
    fn class(&self) -> DeviceClass;

    /// High speed (480 Mbit/s) link rather than full speed (12 Mbit/s)
    fn is_usb2(&self) -> bool;

    fn supported_sample_rates(&self) -> Vec<u32>;

    /// Push settings to the hardware. Only called while no stream runs.
    fn apply_settings(&self, settings: &CaptureSettings) -> Result<(), TransportError>;

    /// Fill `buf` with the next captured bytes, in production order.
    /// Returns the number of bytes written; 0 when nothing is pending yet.
    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_chunk(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Current state of the 8 inputs (single-channel devices)
    fn read_input(&self) -> Result<u8, TransportError>;

    /// Drive the 8 outputs (single-channel devices)
    fn set_output(&self, value: u8) -> Result<(), TransportError>;
}

/// Stable name of a physical unit, e.g. its bus path or serial number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalKey(String);

impl PhysicalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct DiscoveredDevice {
    pub key: PhysicalKey,
    pub transport: Arc<dyn Transport>,
}

impl DiscoveredDevice {
    pub fn new(key: PhysicalKey, transport: Arc<dyn Transport>) -> Self {
        Self { key, transport }
    }
}

impl fmt::Debug for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredDevice")
            .field("key", &self.key)
            .field("class", &self.transport.class())
            .finish()
    }
}

/// Enumerates the devices currently attached to the host
pub trait DeviceDiscovery: Send + Sync {
    /// Every device present right now; a scan must succeed the handshake
    /// before listing a unit.
    fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError>;
}
