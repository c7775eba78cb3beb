use super::block::{CHANNELS, Sample, SampleBlock};
use super::config::{FrequencyLimits, ProtocolConfig};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::{Duration, Instant};

pub const TEST_LIMITS: FrequencyLimits = FrequencyLimits { min: 1, base: 1000 };

const DEFAULT_MEAN: i32 = 9_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;

// Synthetic source: no transport, blocks of random values around `mean`,
// emitted every `block_interval` with monotonically increasing timestamps.
pub struct TestProtocol {
    config: ProtocolConfig,
    samples_per_block: usize,
    mean: i32,
    rng: StdRng,
    open: bool,
    adc_ready: bool,
    receiving: bool,
    next_deadline: Instant,
    epoch: DateTime<Utc>,
    emitted: u64,
}

impl TestProtocol {
    pub fn open(config: ProtocolConfig) -> Result<Self> {
        let samples_per_block = samples_per_block(&config)?;
        Ok(Self {
            config,
            samples_per_block,
            mean: DEFAULT_MEAN,
            rng: StdRng::from_entropy(),
            open: true,
            adc_ready: false,
            receiving: false,
            next_deadline: Instant::now(),
            epoch: Utc::now(),
            emitted: 0,
        })
    }

    pub fn with_mean(mut self, mean: i32) -> Self {
        self.mean = mean;
        self
    }

    pub fn description(&self) -> String {
        format!(
            "Test protocol x{}@{}",
            self.config.sampling_frequency, self.mean
        )
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn check_ready(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::Transport("test protocol is closed".to_string()));
        }
        self.adc_ready = true;
        Ok(())
    }

    pub fn start_receiving(&mut self) -> Result<()> {
        if !self.adc_ready {
            return Err(Error::State("ADC not ready".to_string()));
        }
        if self.receiving {
            return Err(Error::State("already receiving".to_string()));
        }
        // Timestamps restart at the wall clock; nothing is produced while stopped.
        self.epoch = Utc::now();
        self.emitted = 0;
        self.next_deadline = Instant::now() + self.config.block_interval;
        self.receiving = true;
        Ok(())
    }

    pub fn stop_receiving(&mut self) -> Result<()> {
        self.receiving = false;
        Ok(())
    }

    // Wait for the next block boundary, at most one read timeout.
    pub fn read(&mut self) -> Result<Option<SampleBlock>> {
        if !self.receiving {
            return Err(Error::State("read called while not receiving".to_string()));
        }
        let now = Instant::now();
        if now < self.next_deadline {
            thread::sleep((self.next_deadline - now).min(self.config.read_timeout));
            if Instant::now() < self.next_deadline {
                return Ok(None);
            }
        }
        // Deadlines advance on a fixed grid so late reads catch up instead of drifting.
        self.next_deadline += self.config.block_interval;
        self.generate_block().map(Some)
    }

    pub fn set_parameters(&mut self, config: ProtocolConfig) -> Result<()> {
        if self.receiving {
            return Err(Error::State(
                "parameters cannot change while receiving".to_string(),
            ));
        }
        self.samples_per_block = samples_per_block(&config)?;
        self.config = config;
        Ok(())
    }

    pub fn close(&mut self) {
        self.receiving = false;
        self.adc_ready = false;
        self.open = false;
    }

    fn generate_block(&mut self) -> Result<SampleBlock> {
        let epoch = self.epoch;
        let frequency = i64::from(self.config.sampling_frequency);
        let spread = self.mean.unsigned_abs() / 10;

        let mut timestamps = Vec::with_capacity(self.samples_per_block);
        let mut samples = Vec::with_capacity(self.samples_per_block);
        for _ in 0..self.samples_per_block {
            let offset = self.emitted as i64 * NANOS_PER_SECOND as i64 / frequency;
            timestamps.push(epoch + TimeDelta::nanoseconds(offset));
            let mut channels = [0_i32; CHANNELS];
            for value in &mut channels {
                let noise = self.rng.gen_range(0..=spread);
                *value = self.mean.saturating_add_unsigned(noise);
            }
            samples.push(Sample::new(channels));
            self.emitted += 1;
        }
        SampleBlock::new(timestamps, samples)
    }
}

fn samples_per_block(config: &ProtocolConfig) -> Result<usize> {
    TEST_LIMITS.validate(config.sampling_frequency)?;
    let scaled = u128::from(config.sampling_frequency) * config.block_interval.as_nanos();
    if scaled == 0 || scaled % NANOS_PER_SECOND != 0 {
        return Err(Error::Config(format!(
            "block interval of {:?} does not hold a whole number of samples at {} Hz",
            config.block_interval, config.sampling_frequency
        )));
    }
    usize::try_from(scaled / NANOS_PER_SECOND)
        .map_err(|_| Error::Config("block interval is too long".to_string()))
}

pub fn single_sample_interval(frequency: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(frequency.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frequency: u32, interval: Duration) -> ProtocolConfig {
        ProtocolConfig {
            sampling_frequency: frequency,
            block_interval: interval,
            read_timeout: Duration::from_millis(20),
            ..ProtocolConfig::default()
        }
    }

    #[test]
    fn frequency_must_divide_the_synthetic_clock() {
        assert!(TestProtocol::open(config(100, Duration::from_secs(1))).is_ok());
        let err = TestProtocol::open(config(7, Duration::from_secs(1))).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("1000 Hz"));
    }

    #[test]
    fn fractional_block_size_is_rejected() {
        // 100 Hz over 15 ms would be 1.5 samples.
        let result = TestProtocol::open(config(100, Duration::from_millis(15)));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn blocks_have_configured_size_and_monotonic_timestamps() {
        let mut protocol = TestProtocol::open(config(200, Duration::from_millis(50)))
            .unwrap()
            .with_mean(1000);
        assert_eq!(protocol.samples_per_block(), 10);
        protocol.check_ready().unwrap();
        protocol.start_receiving().unwrap();

        let mut blocks = Vec::new();
        while blocks.len() < 3 {
            if let Some(block) = protocol.read().unwrap() {
                blocks.push(block);
            }
        }
        let all: Vec<_> = blocks.iter().flat_map(|b| b.timestamps().to_vec()).collect();
        assert_eq!(all.len(), 30);
        assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(all[1] - all[0], TimeDelta::milliseconds(5));
        for block in &blocks {
            for sample in block.samples() {
                assert!(sample.channels.iter().all(|v| (1000..=1100).contains(v)));
            }
        }
    }

    #[test]
    fn read_requires_receiving_and_readiness() {
        let mut protocol = TestProtocol::open(config(10, Duration::from_secs(1))).unwrap();
        assert!(matches!(protocol.start_receiving(), Err(Error::State(_))));
        assert!(matches!(protocol.read(), Err(Error::State(_))));
        protocol.check_ready().unwrap();
        protocol.start_receiving().unwrap();
        assert!(matches!(protocol.start_receiving(), Err(Error::State(_))));
        assert!(matches!(
            protocol.set_parameters(config(20, Duration::from_secs(1))),
            Err(Error::State(_))
        ));
        protocol.close();
        protocol.close();
        assert!(!protocol.is_open());
    }

    #[test]
    fn restart_skips_the_stopped_interval() {
        let mut protocol = TestProtocol::open(config(100, single_sample_interval(100))).unwrap();
        protocol.check_ready().unwrap();
        protocol.start_receiving().unwrap();
        let before = loop {
            if let Some(block) = protocol.read().unwrap() {
                break block;
            }
        };
        protocol.stop_receiving().unwrap();
        thread::sleep(Duration::from_millis(300));

        let restarted_at = Utc::now();
        protocol.start_receiving().unwrap();
        let started = Instant::now();
        let mut blocks = Vec::new();
        while started.elapsed() < Duration::from_millis(100) {
            if let Some(block) = protocol.read().unwrap() {
                blocks.push(block);
            }
        }
        // About 10 blocks in 100 ms, not a catch-up burst for the 300 ms gap.
        assert!(blocks.len() <= 15, "{} blocks after restart", blocks.len());
        let first = blocks[0].first_timestamp();
        assert!(first >= restarted_at, "{first} before {restarted_at}");
        assert!(first > before.first_timestamp() + TimeDelta::milliseconds(300));
    }

    #[test]
    fn single_sample_interval_matches_frequency() {
        assert_eq!(single_sample_interval(100), Duration::from_millis(10));
        let protocol = TestProtocol::open(config(100, single_sample_interval(100))).unwrap();
        assert_eq!(protocol.samples_per_block(), 1);
    }
}
