use crate::capture_config::ConfigError;
use crate::capture_frame::SampleLayout;

/// Measures a periodic signal on one channel of a read stream.
///
/// Feed it every chunk in delivery order. Frequency and duty cycle are taken
/// over the whole periods seen so far, from the first to the latest rising
/// edge, so they stay exact across chunk boundaries.
#[derive(Debug, Clone)]
pub struct SquareWaveAnalyzer {
    channel: u8,
    bit: usize,
    layout: SampleLayout,
    sample_rate_hz: u32,
    /// Bytes of a sample split across two chunks
    pending: Vec<u8>,
    sample_index: u64,
    last_level: Option<bool>,
    first_rise: Option<u64>,
    last_rise: Option<u64>,
    rises: u64,
    high_since_first_rise: u64,
    high_at_last_rise: u64,
}

impl SquareWaveAnalyzer {
    pub fn new(channel: u8, layout: SampleLayout, sample_rate_hz: u32) -> Result<Self, ConfigError> {
        let bit = layout
            .bit_of(channel)
            .ok_or(ConfigError::ChannelOutOfRange { channel })?;

        Ok(Self {
            channel,
            bit,
            layout,
            sample_rate_hz,
            pending: Vec::new(),
            sample_index: 0,
            last_level: None,
            first_rise: None,
            last_rise: None,
            rises: 0,
            high_since_first_rise: 0,
            high_at_last_rise: 0,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn process(&mut self, chunk: &[u8]) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("square_wave_process"), 0));

        let bps = self.layout.bytes_per_sample();
        let mut data = chunk;

        if !self.pending.is_empty() {
            let missing = bps - self.pending.len();
            let take = missing.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < bps {
                return;
            }
            let sample = std::mem::take(&mut self.pending);
            self.feed_bytes(&sample);
        }

        let whole = self.layout.sample_count(data.len()) * bps;
        self.feed_bytes(&data[..whole]);
        self.pending.extend_from_slice(&data[whole..]);
    }

    fn feed_bytes(&mut self, data: &[u8]) {
        let bit = self.bit;
        let levels: Vec<bool> = self.layout.words(data).map(|w| (w >> bit) & 1 == 1).collect();
        for level in levels {
            self.feed(level);
        }
    }

    fn feed(&mut self, level: bool) {
        if self.last_level == Some(false) && level {
            if self.first_rise.is_none() {
                self.first_rise = Some(self.sample_index);
            }
            self.last_rise = Some(self.sample_index);
            self.rises += 1;
            self.high_at_last_rise = self.high_since_first_rise;
        }
        if level && self.first_rise.is_some() {
            self.high_since_first_rise += 1;
        }
        self.last_level = Some(level);
        self.sample_index += 1;
    }

    /// Samples spanned by the complete periods seen so far
    fn measured_span(&self) -> Option<(u64, u64)> {
        let (first, last) = (self.first_rise?, self.last_rise?);
        if self.rises < 2 || last == first {
            return None;
        }
        Some((last - first, self.rises - 1))
    }

    pub fn frequency_hz(&self) -> Option<f64> {
        let (span, periods) = self.measured_span()?;
        Some(f64::from(self.sample_rate_hz) * periods as f64 / span as f64)
    }

    pub fn period_s(&self) -> Option<f64> {
        self.frequency_hz().map(|f| 1.0 / f)
    }

    /// Fraction of each period spent high, 0.0..=1.0
    pub fn duty_cycle(&self) -> Option<f64> {
        let (span, _) = self.measured_span()?;
        Some(self.high_at_last_rise as f64 / span as f64)
    }

    pub fn samples_seen(&self) -> u64 {
        self.sample_index
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.sample_index = 0;
        self.last_level = None;
        self.first_rise = None;
        self.last_rise = None;
        self.rises = 0;
        self.high_since_first_rise = 0;
        self.high_at_last_rise = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_config::ActiveChannels;

    /// 10 sample period, high for the last 3 samples of each period
    fn single_channel_wave(samples: usize) -> Vec<u8> {
        (0..samples)
            .map(|i| if i % 10 >= 7 { 0b0000_0001 } else { 0 })
            .collect()
    }

    #[test]
    fn test_frequency_and_duty_cycle() {
        let mut analyzer = SquareWaveAnalyzer::new(0, SampleLayout::single_channel(), 1_000_000).unwrap();
        analyzer.process(&single_channel_wave(100));

        let frequency = analyzer.frequency_hz().unwrap();
        assert!((frequency - 100_000.0).abs() < 1e-6);
        assert!((analyzer.period_s().unwrap() - 1e-5).abs() < 1e-12);
        assert!((analyzer.duty_cycle().unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let data = single_channel_wave(100);
        let mut whole = SquareWaveAnalyzer::new(0, SampleLayout::single_channel(), 1_000_000).unwrap();
        whole.process(&data);

        let mut split = SquareWaveAnalyzer::new(0, SampleLayout::single_channel(), 1_000_000).unwrap();
        for chunk in data.chunks(7) {
            split.process(chunk);
        }
        assert_eq!(whole.frequency_hz(), split.frequency_hz());
        assert_eq!(whole.duty_cycle(), split.duty_cycle());
    }

    #[test]
    fn test_multi_channel_split_sample() {
        let active = ActiveChannels::new(&[4, 9]).unwrap();
        let layout = SampleLayout::multi_channel(&active);
        // channel 9 sits on bit 1; period of 4 samples, high for 2
        let mut data = Vec::new();
        for i in 0..40u16 {
            let word: u16 = if i % 4 >= 2 { 0b10 } else { 0 };
            data.extend_from_slice(&word.to_le_bytes());
        }

        let mut analyzer = SquareWaveAnalyzer::new(9, layout, 2_000_000).unwrap();
        for chunk in data.chunks(3) {
            analyzer.process(chunk);
        }
        assert_eq!(analyzer.samples_seen(), 40);
        assert!((analyzer.frequency_hz().unwrap() - 500_000.0).abs() < 1e-6);
        assert!((analyzer.duty_cycle().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_no_measurement_before_two_rising_edges() {
        let mut analyzer = SquareWaveAnalyzer::new(0, SampleLayout::single_channel(), 1_000_000).unwrap();
        analyzer.process(&[0, 0, 1, 1, 0]);
        assert_eq!(analyzer.frequency_hz(), None);
        assert_eq!(analyzer.duty_cycle(), None);

        analyzer.reset();
        assert_eq!(analyzer.samples_seen(), 0);
    }

    #[test]
    fn test_channel_must_be_captured() {
        let active = ActiveChannels::new(&[0, 1]).unwrap();
        let result = SquareWaveAnalyzer::new(5, SampleLayout::multi_channel(&active), 1_000_000);
        assert_eq!(result.err(), Some(ConfigError::ChannelOutOfRange { channel: 5 }));
    }
}
