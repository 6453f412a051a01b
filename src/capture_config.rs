use std::fmt;
use std::sync::Arc;

/// Channels a multi-channel device can capture in parallel
pub const MAX_ACTIVE_CHANNELS: usize = 16;

/// Rates reported by single-channel (8 bit, byte I/O) devices
pub const SINGLE_CHANNEL_SAMPLE_RATES: [u32; 13] = [
    24_000_000, 16_000_000, 12_000_000, 8_000_000, 4_000_000, 2_000_000, 1_000_000, 500_000,
    250_000, 200_000, 100_000, 50_000, 25_000,
];

/// Rates reported by 16-channel parallel capture devices
pub const MULTI_CHANNEL_SAMPLE_RATES: [u32; 24] = [
    100_000_000, 80_000_000, 50_000_000, 40_000_000, 32_000_000, 25_000_000, 20_000_000,
    16_000_000, 12_500_000, 10_000_000, 8_000_000, 6_250_000, 5_000_000, 4_000_000, 3_125_000,
    2_500_000, 2_000_000, 1_562_500, 1_250_000, 1_000_000, 500_000, 250_000, 100_000, 50_000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// 8 inputs sampled into one byte, with single-byte input/output
    SingleChannel,
    /// Up to 16 inputs captured in parallel with a selectable threshold
    MultiChannel,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::SingleChannel => "single-channel",
            DeviceClass::MultiChannel => "multi-channel",
        }
    }

    pub fn channel_count(&self) -> u8 {
        match self {
            DeviceClass::SingleChannel => 8,
            DeviceClass::MultiChannel => MAX_ACTIVE_CHANNELS as u8,
        }
    }

    pub fn default_sample_rates(&self) -> &'static [u32] {
        match self {
            DeviceClass::SingleChannel => &SINGLE_CHANNEL_SAMPLE_RATES,
            DeviceClass::MultiChannel => &MULTI_CHANNEL_SAMPLE_RATES,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Sample rate {rate} Hz is not supported by this {class} device")]
    UnsupportedSampleRate { rate: u32, class: DeviceClass },

    #[error("Active channel set must contain at least one channel")]
    EmptyChannelSet,

    #[error("Too many active channels ({count}, max 16)")]
    TooManyChannels { count: usize },

    #[error("Channel {channel} out of range (0..16)")]
    ChannelOutOfRange { channel: u8 },

    #[error("Channel {channel} listed more than once")]
    DuplicateChannel { channel: u8 },

    #[error("{operation} is not available on a {class} device")]
    UnsupportedOperation {
        operation: &'static str,
        class: DeviceClass,
    },
}

/// Supported sample rates of one device, highest first.
///
/// Cheap to clone; every call to `iter` restarts from the highest rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRates {
    rates: Arc<[u32]>,
}

impl SampleRates {
    /// Normalize a device-reported list: zero rates are dropped, the rest
    /// sorted descending without duplicates.
    pub fn from_reported(reported: &[u32], class: DeviceClass) -> Self {
        let mut rates: Vec<u32> = reported.iter().copied().filter(|&r| r > 0).collect();
        rates.sort_unstable_by(|a, b| b.cmp(a));
        rates.dedup();

        if rates.is_empty() {
            log::warn!(
                "Device reported no usable sample rates, using {} defaults",
                class
            );
            rates = class.default_sample_rates().to_vec();
        }

        Self {
            rates: rates.into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + Clone + '_ {
        self.rates.iter().copied()
    }

    pub fn contains(&self, rate: u32) -> bool {
        self.rates.contains(&rate)
    }

    pub fn highest(&self) -> u32 {
        self.rates[0]
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.rates.to_vec()
    }
}

impl<'a> IntoIterator for &'a SampleRates {
    type Item = u32;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, u32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rates.iter().copied()
    }
}

/// Ordered channel selection of a multi-channel capture.
///
/// Position `k` in the set is bit `k` of every captured sample word.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActiveChannels(Vec<u8>);

impl ActiveChannels {
    pub fn new(channels: &[u8]) -> Result<Self, ConfigError> {
        if channels.is_empty() {
            return Err(ConfigError::EmptyChannelSet);
        }
        if channels.len() > MAX_ACTIVE_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                count: channels.len(),
            });
        }

        let mut seen = 0u16;
        for &channel in channels {
            if usize::from(channel) >= MAX_ACTIVE_CHANNELS {
                return Err(ConfigError::ChannelOutOfRange { channel });
            }
            let bit = 1u16 << channel;
            if seen & bit != 0 {
                return Err(ConfigError::DuplicateChannel { channel });
            }
            seen |= bit;
        }

        Ok(Self(channels.to_vec()))
    }

    /// Channels `0..count` in ascending order
    pub fn first(count: u8) -> Result<Self, ConfigError> {
        let channels: Vec<u8> = (0..count).collect();
        Self::new(&channels)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bit position of `channel` within a sample word, if it is captured
    pub fn bit_of(&self, channel: u8) -> Option<usize> {
        self.0.iter().position(|&c| c == channel)
    }
}

impl TryFrom<&[u8]> for ActiveChannels {
    type Error = ConfigError;

    fn try_from(channels: &[u8]) -> Result<Self, Self::Error> {
        Self::new(channels)
    }
}

/// Snapshot of everything a device is configured with before streaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub sample_rate_hz: u32,
    /// Only present on multi-channel devices
    pub active_channels: Option<ActiveChannels>,
    /// Only meaningful on multi-channel devices
    pub use_5_volts: bool,
}

impl CaptureSettings {
    pub fn defaults_for(class: DeviceClass, rates: &SampleRates) -> Self {
        let active_channels = match class {
            DeviceClass::SingleChannel => None,
            // 16 is within 1..=16, so this never takes the error branch
            DeviceClass::MultiChannel => ActiveChannels::first(class.channel_count()).ok(),
        };

        Self {
            sample_rate_hz: rates.highest(),
            active_channels,
            use_5_volts: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_normalized_descending() {
        let rates = SampleRates::from_reported(
            &[12_000_000, 0, 24_000_000, 12_000_000],
            DeviceClass::SingleChannel,
        );
        assert_eq!(rates.to_vec(), vec![24_000_000, 12_000_000]);
        assert_eq!(rates.highest(), 24_000_000);
        assert!(rates.contains(12_000_000));
        assert!(!rates.contains(9600));
    }

    #[test]
    fn test_rates_restartable() {
        let rates = SampleRates::from_reported(&SINGLE_CHANNEL_SAMPLE_RATES, DeviceClass::SingleChannel);
        let first: Vec<u32> = rates.iter().collect();
        let second: Vec<u32> = (&rates).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), SINGLE_CHANNEL_SAMPLE_RATES.len());
        assert!(first.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_empty_report_falls_back_to_class_defaults() {
        let rates = SampleRates::from_reported(&[], DeviceClass::MultiChannel);
        assert_eq!(rates.to_vec(), MULTI_CHANNEL_SAMPLE_RATES.to_vec());
    }

    #[test]
    fn test_default_tables_descending() {
        for class in [DeviceClass::SingleChannel, DeviceClass::MultiChannel] {
            let table = class.default_sample_rates();
            assert!(table.windows(2).all(|w| w[0] > w[1]), "{class} table not descending");
        }
    }

    #[test]
    fn test_active_channels_keep_order() {
        let channels = ActiveChannels::new(&[3, 7, 1]).unwrap();
        assert_eq!(channels.as_slice(), &[3, 7, 1]);
        assert_eq!(channels.bit_of(7), Some(1));
        assert_eq!(channels.bit_of(2), None);
    }

    #[test]
    fn test_active_channels_rejects_malformed_sets() {
        assert_eq!(ActiveChannels::new(&[]), Err(ConfigError::EmptyChannelSet));
        assert_eq!(
            ActiveChannels::new(&[1, 16]),
            Err(ConfigError::ChannelOutOfRange { channel: 16 })
        );
        assert_eq!(
            ActiveChannels::new(&[4, 2, 4]),
            Err(ConfigError::DuplicateChannel { channel: 4 })
        );
        let seventeen: Vec<u8> = (0..17).map(|c| c % 16).collect();
        assert_eq!(
            ActiveChannels::new(&seventeen),
            Err(ConfigError::TooManyChannels { count: 17 })
        );
    }

    #[test]
    fn test_all_sixteen_channels_accepted() {
        let all = ActiveChannels::first(16).unwrap();
        assert_eq!(all.len(), 16);
        assert_eq!(all.as_slice()[15], 15);
    }

    #[test]
    fn test_defaults_per_class() {
        let single_rates = SampleRates::from_reported(&SINGLE_CHANNEL_SAMPLE_RATES, DeviceClass::SingleChannel);
        let single = CaptureSettings::defaults_for(DeviceClass::SingleChannel, &single_rates);
        assert_eq!(single.sample_rate_hz, 24_000_000);
        assert!(single.active_channels.is_none());

        let multi_rates = SampleRates::from_reported(&MULTI_CHANNEL_SAMPLE_RATES, DeviceClass::MultiChannel);
        let multi = CaptureSettings::defaults_for(DeviceClass::MultiChannel, &multi_rates);
        assert_eq!(multi.active_channels.map(|c| c.len()), Some(16));
        assert!(!multi.use_5_volts);
    }
}
