use crate::capture_config::{ActiveChannels, CaptureSettings, DeviceClass};
use polars::prelude::*;

pub const TIME_COLUMN_NAME: &str = "time";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// Column holding the levels of `channel`
pub fn channel_column_name(channel: u8) -> String {
    format!("ch{channel}")
}

/// How captured bytes map to channels.
///
/// Single-channel devices deliver one byte per sample, bit `k` being input
/// `k`. Multi-channel devices deliver a little-endian 16-bit word per sample
/// whose bit `k` is the `k`-th active channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLayout {
    bytes_per_sample: usize,
    channels: Vec<u8>,
}

impl SampleLayout {
    pub fn single_channel() -> Self {
        Self {
            bytes_per_sample: 1,
            channels: (0..DeviceClass::SingleChannel.channel_count()).collect(),
        }
    }

    pub fn multi_channel(active: &ActiveChannels) -> Self {
        Self {
            bytes_per_sample: 2,
            channels: active.as_slice().to_vec(),
        }
    }

    pub fn for_settings(class: DeviceClass, settings: &CaptureSettings) -> Self {
        match (class, &settings.active_channels) {
            (DeviceClass::MultiChannel, Some(active)) => Self::multi_channel(active),
            (DeviceClass::MultiChannel, None) => Self {
                bytes_per_sample: 2,
                channels: (0..DeviceClass::MultiChannel.channel_count()).collect(),
            },
            (DeviceClass::SingleChannel, _) => Self::single_channel(),
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// Channel carried by each bit position, lowest bit first
    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    pub fn bit_of(&self, channel: u8) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    /// Complete samples in `len` bytes
    pub fn sample_count(&self, len: usize) -> usize {
        len / self.bytes_per_sample
    }

    /// Sample words of `data`; a trailing partial sample is skipped
    pub fn words<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = u16> + 'a {
        data.chunks_exact(self.bytes_per_sample).map(|sample| match *sample {
            [low, high] => u16::from_le_bytes([low, high]),
            [byte] => u16::from(byte),
            _ => 0,
        })
    }
}

/// Turn raw capture bytes into a frame with a `time` column in seconds
/// followed by one boolean column per captured channel.
pub fn to_data_frame(
    data: &[u8],
    layout: &SampleLayout,
    sample_rate_hz: u32,
) -> PolarsResult<DataFrame> {
    #[cfg(feature = "cpu-profiling")]
    let _zone = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("to_data_frame"), 0));

    let words: Vec<u16> = layout.words(data).collect();

    let mut columns: Vec<Column> = Vec::with_capacity(layout.channels().len());
    for (bit, &channel) in layout.channels().iter().enumerate() {
        let values: Vec<bool> = words.iter().map(|&word| (word >> bit) & 1 == 1).collect();
        let column: Column = Series::new(channel_column_name(channel).into(), values).into();
        columns.push(column);
    }

    let mut selection = vec![col(TIME_COLUMN_NAME)];
    selection.extend(
        layout
            .channels()
            .iter()
            .map(|&channel| col(channel_column_name(channel))),
    );

    let sample_period = 1.0 / f64::from(sample_rate_hz.max(1));

    DataFrame::new(columns)?
        .lazy()
        .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
        .with_column(
            (col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64) * lit(sample_period))
                .alias(TIME_COLUMN_NAME),
        )
        .select(selection)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_channel_words() {
        let layout = SampleLayout::single_channel();
        assert_eq!(layout.channels().len(), 8);
        let words: Vec<u16> = layout.words(&[0x01, 0x80]).collect();
        assert_eq!(words, vec![0x01, 0x80]);
    }

    #[test]
    fn test_multi_channel_words_skip_partial_sample() {
        let active = ActiveChannels::new(&[3, 7, 1]).unwrap();
        let layout = SampleLayout::multi_channel(&active);
        assert_eq!(layout.bit_of(7), Some(1));
        assert_eq!(layout.sample_count(5), 2);

        let words: Vec<u16> = layout.words(&[0x02, 0x00, 0x34, 0x12, 0xFF]).collect();
        assert_eq!(words, vec![0x0002, 0x1234]);
    }

    #[test]
    fn test_layout_follows_settings() {
        let settings = CaptureSettings {
            sample_rate_hz: 1_000_000,
            active_channels: Some(ActiveChannels::new(&[5, 0]).unwrap()),
            use_5_volts: false,
        };
        let layout = SampleLayout::for_settings(DeviceClass::MultiChannel, &settings);
        assert_eq!(layout.channels(), &[5, 0]);
        assert_eq!(layout.bytes_per_sample(), 2);

        let single = SampleLayout::for_settings(DeviceClass::SingleChannel, &settings);
        assert_eq!(single.bytes_per_sample(), 1);
    }

    #[test]
    fn test_data_frame_columns_follow_active_order() {
        let active = ActiveChannels::new(&[3, 7, 1]).unwrap();
        let layout = SampleLayout::multi_channel(&active);
        // bit 0 -> ch3, bit 1 -> ch7, bit 2 -> ch1
        let data = [0b001, 0x00, 0b110, 0x00];

        let df = to_data_frame(&data, &layout, 1_000_000).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 4);

        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["time", "ch3", "ch7", "ch1"]);

        let ch3 = df.column("ch3").unwrap().bool().unwrap();
        assert_eq!(ch3.get(0), Some(true));
        assert_eq!(ch3.get(1), Some(false));
        let ch1 = df.column("ch1").unwrap().bool().unwrap();
        assert_eq!(ch1.get(1), Some(true));

        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(0), Some(0.0));
        assert!((time.get(1).unwrap() - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn test_empty_capture_gives_empty_frame() {
        let df = to_data_frame(&[], &SampleLayout::single_channel(), 25_000).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), 9);
    }
}
