use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

// Channels delivered by the ADC per sample.
pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub channels: [i32; CHANNELS],
}

impl Sample {
    pub fn new(channels: [i32; CHANNELS]) -> Self {
        Self { channels }
    }
}

// Timestamps paired 1:1 with samples, delivered by a single read.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    first_timestamp: DateTime<Utc>,
    timestamps: Vec<DateTime<Utc>>,
    samples: Vec<Sample>,
}

impl SampleBlock {
    // Pair timestamps with samples. Unequal lengths or an empty block are rejected.
    pub fn new(timestamps: Vec<DateTime<Utc>>, samples: Vec<Sample>) -> Result<Self> {
        if timestamps.len() != samples.len() {
            return Err(Error::Integrity(format!(
                "block has {} timestamps but {} samples",
                timestamps.len(),
                samples.len()
            )));
        }
        let Some(&first_timestamp) = timestamps.first() else {
            return Err(Error::Integrity("block holds no samples".to_string()));
        };
        Ok(Self {
            first_timestamp,
            timestamps,
            samples,
        })
    }

    pub fn first_timestamp(&self) -> DateTime<Utc> {
        self.first_timestamp
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &Sample)> {
        self.timestamps.iter().zip(self.samples.iter())
    }

    pub fn stats(&self) -> BlockStats {
        BlockStats::from_samples(&self.samples)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockStats {
    pub count: usize,
    pub min: [i32; CHANNELS],
    pub max: [i32; CHANNELS],
    pub mean: [f64; CHANNELS],
}

impl BlockStats {
    fn from_samples(samples: &[Sample]) -> Self {
        let Some(first) = samples.first() else {
            return Self::default();
        };
        let mut min = first.channels;
        let mut max = first.channels;
        let mut sums = [0_f64; CHANNELS];
        for sample in samples {
            for ch in 0..CHANNELS {
                let value = sample.channels[ch];
                min[ch] = min[ch].min(value);
                max[ch] = max[ch].max(value);
                sums[ch] += f64::from(value);
            }
        }
        let count = samples.len();
        Self {
            count,
            min,
            max,
            mean: sums.map(|sum| sum / count as f64),
        }
    }
}
