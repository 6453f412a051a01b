use crate::buffer::{BufferLedger, ReadBuffer};
use crate::capture_config::{ActiveChannels, CaptureSettings, ConfigError, DeviceClass, SampleRates};
use crate::capture_frame::SampleLayout;
use crate::device_events::EventBus;
use crate::streaming::{LinkLostHook, StreamMode, StreamOptions, StreamingController, StreamingState};
use crate::transport::{DiscoveredDevice, PhysicalKey, Transport, TransportError};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical connection.
///
/// Assigned on connect, never handed out again within the process, even when
/// the same unit is plugged back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Fresh id, shared across every manager in the process
    pub(crate) fn allocate() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Cannot {requested} on device {device} while {state}")]
    InvalidStateTransition {
        device: DeviceId,
        state: StreamingState,
        requested: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Device {0} is disconnected, its handle can no longer be used")]
    StaleHandle(DeviceId),

    #[error("Device communication error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to start streaming worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

impl DeviceError {
    /// Caller bugs, as opposed to failures of the device or the host
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidStateTransition { .. }
                | DeviceError::Configuration(_)
                | DeviceError::StaleHandle(_)
        )
    }
}

struct DeviceInner {
    id: DeviceId,
    key: PhysicalKey,
    class: DeviceClass,
    usb2: bool,
    rates: SampleRates,
    transport: Arc<dyn Transport>,
    settings: Mutex<CaptureSettings>,
    streaming: StreamingController,
}

/// Capability view of one connected device.
///
/// Cheap to clone; all clones share the device's state. Once the device
/// disconnects every fallible call returns `DeviceError::StaleHandle`.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

/// Class-specific view of a handle
#[derive(Clone)]
pub enum DeviceVariant {
    SingleChannel(SingleChannelHandle),
    MultiChannel(MultiChannelHandle),
}

impl DeviceHandle {
    /// Read what the device reports about itself and push default settings
    pub(crate) fn attach(
        id: DeviceId,
        discovered: DiscoveredDevice,
        ledger: Arc<BufferLedger>,
        events: Arc<EventBus>,
        link_lost: LinkLostHook,
        options: StreamOptions,
    ) -> Result<Self, TransportError> {
        let DiscoveredDevice { key, transport } = discovered;
        let class = transport.class();
        let rates = SampleRates::from_reported(&transport.supported_sample_rates(), class);
        let settings = CaptureSettings::defaults_for(class, &rates);
        transport.apply_settings(&settings)?;

        let streaming = StreamingController::new(
            id,
            Arc::clone(&transport),
            ledger,
            events,
            link_lost,
            options,
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                key,
                class,
                usb2: transport.is_usb2(),
                rates,
                transport,
                settings: Mutex::new(settings),
                streaming,
            }),
        })
    }

    pub(crate) fn detach(&self) {
        self.inner.streaming.detach();
    }

    fn settings_lock(&self) -> MutexGuard<'_, CaptureSettings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.inner.streaming.is_detached() {
            return Err(DeviceError::StaleHandle(self.inner.id));
        }
        Ok(())
    }

    fn unsupported(&self, operation: &'static str) -> DeviceError {
        ConfigError::UnsupportedOperation {
            operation,
            class: self.inner.class,
        }
        .into()
    }

    /// Apply a settings change to the hardware, then remember it. Only
    /// called from inside `while_idle`.
    fn update_settings(&self, change: impl FnOnce(&mut CaptureSettings)) -> Result<(), DeviceError> {
        let mut settings = self.settings_lock();
        let mut next = settings.clone();
        change(&mut next);
        self.inner.transport.apply_settings(&next)?;
        *settings = next;
        Ok(())
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn physical_key(&self) -> &PhysicalKey {
        &self.inner.key
    }

    pub fn class(&self) -> DeviceClass {
        self.inner.class
    }

    // Identity and state queries stay infallible after disconnect, so a
    // stale handle can still be logged and matched against notifications.
    // Everything else returns `DeviceError::StaleHandle`.

    /// High speed (480 Mbit/s) rather than full speed (12 Mbit/s)
    pub fn is_usb2(&self) -> bool {
        self.inner.usb2
    }

    pub fn channel_count(&self) -> u8 {
        self.inner.class.channel_count()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.streaming.is_detached()
    }

    /// `Idle` once disconnected; check `is_connected` to tell the two apart
    pub fn state(&self) -> StreamingState {
        self.inner.streaming.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() != StreamingState::Idle
    }

    pub fn variant(&self) -> DeviceVariant {
        match self.inner.class {
            DeviceClass::SingleChannel => DeviceVariant::SingleChannel(SingleChannelHandle(self.clone())),
            DeviceClass::MultiChannel => DeviceVariant::MultiChannel(MultiChannelHandle(self.clone())),
        }
    }

    pub fn as_single_channel(&self) -> Result<SingleChannelHandle, DeviceError> {
        match self.variant() {
            DeviceVariant::SingleChannel(handle) => Ok(handle),
            DeviceVariant::MultiChannel(_) => Err(self.unsupported("single-byte I/O")),
        }
    }

    pub fn as_multi_channel(&self) -> Result<MultiChannelHandle, DeviceError> {
        match self.variant() {
            DeviceVariant::MultiChannel(handle) => Ok(handle),
            DeviceVariant::SingleChannel(_) => Err(self.unsupported("channel selection")),
        }
    }

    pub fn supported_sample_rates(&self) -> Result<SampleRates, DeviceError> {
        self.ensure_connected()?;
        Ok(self.inner.rates.clone())
    }

    pub fn sample_rate_hz(&self) -> Result<u32, DeviceError> {
        self.ensure_connected()?;
        Ok(self.settings_lock().sample_rate_hz)
    }

    pub fn set_sample_rate_hz(&self, rate: u32) -> Result<(), DeviceError> {
        self.inner.streaming.while_idle("set_sample_rate_hz", || {
            if !self.inner.rates.contains(rate) {
                return Err(ConfigError::UnsupportedSampleRate {
                    rate,
                    class: self.inner.class,
                }
                .into());
            }
            self.update_settings(|s| s.sample_rate_hz = rate)?;
            log::debug!("Device {} sample rate set to {} Hz", self.inner.id, rate);
            Ok(())
        })
    }

    pub fn settings(&self) -> Result<CaptureSettings, DeviceError> {
        self.ensure_connected()?;
        Ok(self.settings_lock().clone())
    }

    /// How the bytes of a read chunk map to channels under the current settings
    pub fn sample_layout(&self) -> Result<SampleLayout, DeviceError> {
        let settings = self.settings()?;
        Ok(SampleLayout::for_settings(self.inner.class, &settings))
    }

    /// Replaces any earlier read-data callback
    pub fn register_on_read_data<F>(&self, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(DeviceId, ReadBuffer) + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.inner.streaming.set_read_callback(Arc::new(callback));
        Ok(())
    }

    /// Replaces any earlier write-data callback
    pub fn register_on_write_data<F>(&self, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(DeviceId, &mut [u8]) + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.inner.streaming.set_write_callback(Arc::new(callback));
        Ok(())
    }

    /// Replaces any earlier error callback
    pub fn register_on_error<F>(&self, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(DeviceId, &TransportError) + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.inner.streaming.set_error_callback(Arc::new(callback));
        Ok(())
    }

    /// Start capturing; chunks arrive through the read-data callback.
    /// Nothing is read from the device until such a callback is registered.
    pub fn read_start(&self) -> Result<(), DeviceError> {
        self.inner.streaming.start(StreamMode::Read)
    }

    /// Start output; the write-data callback is asked for each chunk.
    /// Multi-channel devices have no output stream.
    pub fn write_start(&self) -> Result<(), DeviceError> {
        if self.inner.class == DeviceClass::MultiChannel {
            self.ensure_connected()?;
            return Err(self.unsupported("write_start"));
        }
        self.inner.streaming.start(StreamMode::Write)
    }

    /// Stop the running stream. No data callback fires once this returns.
    pub fn stop(&self) -> Result<(), DeviceError> {
        self.inner.streaming.stop()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("class", &self.inner.class)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle of a device with single-byte input/output
#[derive(Clone, Debug)]
pub struct SingleChannelHandle(DeviceHandle);

impl SingleChannelHandle {
    /// Sample the 8 inputs once. Not available while streaming.
    pub fn get_input(&self) -> Result<u8, DeviceError> {
        self.0
            .inner
            .streaming
            .while_idle("get_input", || Ok(self.0.inner.transport.read_input()?))
    }

    /// Drive the 8 outputs. Not available while streaming.
    pub fn set_output(&self, value: u8) -> Result<(), DeviceError> {
        self.0.inner.streaming.while_idle("set_output", || {
            self.0.inner.transport.set_output(value)?;
            Ok(())
        })
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.0
    }
}

impl Deref for SingleChannelHandle {
    type Target = DeviceHandle;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Handle of a 16-channel parallel capture device
#[derive(Clone, Debug)]
pub struct MultiChannelHandle(DeviceHandle);

impl MultiChannelHandle {
    /// Replace the captured channel set. Order sets the bit position of
    /// each channel within a sample word.
    pub fn set_active_channels(&self, channels: &[u8]) -> Result<(), DeviceError> {
        self.0.inner.streaming.while_idle("set_active_channels", || {
            let channels = ActiveChannels::new(channels)?;
            log::debug!("Device {} active channels {:?}", self.0.inner.id, channels.as_slice());
            self.0.update_settings(|s| s.active_channels = Some(channels))
        })
    }

    pub fn active_channels(&self) -> Result<ActiveChannels, DeviceError> {
        let settings = self.0.settings()?;
        settings
            .active_channels
            .ok_or_else(|| self.0.unsupported("channel selection"))
    }

    /// Use 5 V logic thresholds; `false` covers 3.3 V, 2.5 V and 1.8 V logic
    pub fn set_use_5_volts(&self, use_5_volts: bool) -> Result<(), DeviceError> {
        self.0.inner.streaming.while_idle("set_use_5_volts", || {
            self.0.update_settings(|s| s.use_5_volts = use_5_volts)
        })
    }

    pub fn use_5_volts(&self) -> Result<bool, DeviceError> {
        Ok(self.0.settings()?.use_5_volts)
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.0
    }
}

impl Deref for MultiChannelHandle {
    type Target = DeviceHandle;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
