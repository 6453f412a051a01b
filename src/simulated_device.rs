//! In-process devices for tests and demos.
//!
//! `SimulatedDevice` implements `Transport` without hardware, producing
//! deterministic sample data. `SimulatedBus` implements `DeviceDiscovery`
//! over a set of simulated devices that can be plugged and unplugged at will.
//!
//! ```rust
//! use logic_device_rs::{DeviceClass, SimulatedBus, SimulatedDevice};
//!
//! let bus = SimulatedBus::new();
//! let device = SimulatedDevice::new(DeviceClass::MultiChannel).shared();
//! bus.plug("usb-1-2", device);
//! assert_eq!(bus.len(), 1);
//! ```

use crate::capture_config::{CaptureSettings, DeviceClass};
use crate::transport::{DeviceDiscovery, DiscoveredDevice, PhysicalKey, Transport, TransportError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// What a simulated device captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPattern {
    /// Every byte is one more than the previous, wrapping at 255
    Counter,
    /// All inputs high for `high` samples out of every `period`
    Square { period: u32, high: u32 },
}

#[derive(Debug)]
struct SimState {
    unplugged: bool,
    pending_failure: Option<TransportError>,
    chunk_limit: Option<u64>,
    chunks_served: u64,
    /// Bytes produced so far for `Counter`, samples so far for `Square`
    position: u64,
    written: Vec<u8>,
    input: u8,
    output: Option<u8>,
    settings: Option<CaptureSettings>,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    class: DeviceClass,
    usb2: bool,
    rates: Vec<u32>,
    pattern: SignalPattern,
    chunk_interval: Duration,
    chunk_len: Option<usize>,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            usb2: true,
            rates: class.default_sample_rates().to_vec(),
            pattern: SignalPattern::Counter,
            chunk_interval: Duration::from_millis(1),
            chunk_len: None,
            state: Mutex::new(SimState {
                unplugged: false,
                pending_failure: None,
                chunk_limit: None,
                chunks_served: 0,
                position: 0,
                written: Vec::new(),
                input: 0,
                output: None,
                settings: None,
            }),
        }
    }

    pub fn with_sample_rates(mut self, rates: Vec<u32>) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_usb2(mut self, usb2: bool) -> Self {
        self.usb2 = usb2;
        self
    }

    pub fn with_pattern(mut self, pattern: SignalPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Delay before each chunk, standing in for the bus transfer time
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    /// Produce at most `len` bytes per chunk
    pub fn with_chunk_len(mut self, len: usize) -> Self {
        self.chunk_len = Some(len);
        self
    }

    /// Stop producing data after `limit` chunks
    pub fn with_chunk_limit(self, limit: u64) -> Self {
        self.lock().chunk_limit = Some(limit);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next read or write fail with `error`
    pub fn fail_next_transfer(&self, error: TransportError) {
        self.lock().pending_failure = Some(error);
    }

    /// Drop off the bus: every later call fails with `Disconnected`
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    pub fn is_unplugged(&self) -> bool {
        self.lock().unplugged
    }

    pub fn set_input(&self, value: u8) {
        self.lock().input = value;
    }

    pub fn output(&self) -> Option<u8> {
        self.lock().output
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn chunks_served(&self) -> u64 {
        self.lock().chunks_served
    }

    /// Last settings pushed by the driver
    pub fn applied_settings(&self) -> Option<CaptureSettings> {
        self.lock().settings.clone()
    }

    fn bytes_per_sample(&self) -> usize {
        match self.class {
            DeviceClass::SingleChannel => 1,
            DeviceClass::MultiChannel => 2,
        }
    }

    fn check_link(state: &mut SimState) -> Result<(), TransportError> {
        if state.unplugged {
            return Err(TransportError::Disconnected);
        }
        if let Some(error) = state.pending_failure.take() {
            return Err(error);
        }
        Ok(())
    }

    fn fill(&self, state: &mut SimState, buf: &mut [u8]) -> usize {
        match self.pattern {
            SignalPattern::Counter => {
                for byte in buf.iter_mut() {
                    *byte = state.position as u8;
                    state.position += 1;
                }
                buf.len()
            }
            SignalPattern::Square { period, high } => {
                let bps = self.bytes_per_sample();
                let period = u64::from(period.max(1));
                let mut filled = 0;
                for sample in buf.chunks_exact_mut(bps) {
                    let level = if state.position % period < u64::from(high) { 0xFF } else { 0x00 };
                    sample.fill(level);
                    state.position += 1;
                    filled += bps;
                }
                filled
            }
        }
    }
}

impl Transport for SimulatedDevice {
    fn class(&self) -> DeviceClass {
        self.class
    }

    fn is_usb2(&self) -> bool {
        self.usb2
    }

    fn supported_sample_rates(&self) -> Vec<u32> {
        self.rates.clone()
    }

    fn apply_settings(&self, settings: &CaptureSettings) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(TransportError::Disconnected);
        }
        state.settings = Some(settings.clone());
        Ok(())
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        {
            let mut state = self.lock();
            Self::check_link(&mut state)?;
            if state.chunk_limit.is_some_and(|limit| state.chunks_served >= limit) {
                return Ok(0);
            }
        }

        thread::sleep(self.chunk_interval);

        let mut state = self.lock();
        Self::check_link(&mut state)?;
        let len = self.chunk_len.map_or(buf.len(), |l| l.min(buf.len()));
        let n = self.fill(&mut state, &mut buf[..len]);
        state.chunks_served += 1;
        Ok(n)
    }

    fn write_chunk(&self, data: &[u8]) -> Result<(), TransportError> {
        thread::sleep(self.chunk_interval);
        let mut state = self.lock();
        Self::check_link(&mut state)?;
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn read_input(&self) -> Result<u8, TransportError> {
        let mut state = self.lock();
        Self::check_link(&mut state)?;
        Ok(state.input)
    }

    fn set_output(&self, value: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check_link(&mut state)?;
        state.output = Some(value);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<PhysicalKey, Arc<SimulatedDevice>>,
    pending_failure: Option<String>,
    scans: u64,
}

/// A host bus populated by hand. Clones share the same bus.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn plug(&self, key: &str, device: Arc<SimulatedDevice>) {
        self.lock().devices.insert(PhysicalKey::new(key), device);
    }

    /// Remove a device; it also fails every transfer from now on
    pub fn unplug(&self, key: &str) -> Option<Arc<SimulatedDevice>> {
        let device = self.lock().devices.remove(&PhysicalKey::new(key))?;
        device.unplug();
        Some(device)
    }

    pub fn fail_next_scan(&self, message: &str) {
        self.lock().pending_failure = Some(message.to_string());
    }

    pub fn scans(&self) -> u64 {
        self.lock().scans
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }
}

impl DeviceDiscovery for SimulatedBus {
    fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut state = self.lock();
        state.scans += 1;
        if let Some(message) = state.pending_failure.take() {
            return Err(TransportError::Enumeration(message));
        }
        Ok(state
            .devices
            .iter()
            .map(|(key, device)| {
                let transport: Arc<dyn Transport> = Arc::clone(device) as Arc<dyn Transport>;
                DiscoveredDevice::new(key.clone(), transport)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_pattern_continues_across_chunks() {
        let device = SimulatedDevice::new(DeviceClass::SingleChannel)
            .with_chunk_interval(Duration::ZERO)
            .with_chunk_len(3);
        let mut buf = [0u8; 8];

        assert_eq!(device.read_chunk(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[0, 1, 2]);
        assert_eq!(device.read_chunk(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[3, 4, 5]);
    }

    #[test]
    fn test_square_pattern_two_bytes_per_sample() {
        let device = SimulatedDevice::new(DeviceClass::MultiChannel)
            .with_chunk_interval(Duration::ZERO)
            .with_pattern(SignalPattern::Square { period: 4, high: 1 });
        let mut buf = [0u8; 9];

        assert_eq!(device.read_chunk(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &[0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_chunk_limit_then_idle() {
        let device = SimulatedDevice::new(DeviceClass::SingleChannel)
            .with_chunk_interval(Duration::ZERO)
            .with_chunk_limit(1);
        let mut buf = [0u8; 4];

        assert_eq!(device.read_chunk(&mut buf).unwrap(), 4);
        assert_eq!(device.read_chunk(&mut buf).unwrap(), 0);
        assert_eq!(device.chunks_served(), 1);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let device = SimulatedDevice::new(DeviceClass::SingleChannel).with_chunk_interval(Duration::ZERO);
        device.fail_next_transfer(TransportError::Timeout);
        let mut buf = [0u8; 4];

        assert_eq!(device.read_chunk(&mut buf), Err(TransportError::Timeout));
        assert!(device.read_chunk(&mut buf).is_ok());
    }

    #[test]
    fn test_unplug_from_bus() {
        let bus = SimulatedBus::new();
        bus.plug("a", SimulatedDevice::new(DeviceClass::SingleChannel).shared());
        bus.plug("b", SimulatedDevice::new(DeviceClass::MultiChannel).shared());
        assert_eq!(bus.scan().unwrap().len(), 2);

        let removed = bus.unplug("a").unwrap();
        assert!(removed.is_unplugged());
        assert_eq!(removed.read_input(), Err(TransportError::Disconnected));

        let keys: Vec<String> = bus
            .scan()
            .unwrap()
            .into_iter()
            .map(|d| d.key.to_string())
            .collect();
        assert_eq!(keys, vec!["b".to_string()]);
        assert_eq!(bus.scans(), 2);
    }

    #[test]
    fn test_scan_failure_is_one_shot() {
        let bus = SimulatedBus::new();
        bus.fail_next_scan("hub reset");
        assert!(matches!(bus.scan(), Err(TransportError::Enumeration(_))));
        assert!(bus.scan().is_ok());
    }
}
