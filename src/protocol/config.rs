use crate::error::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::time::Duration;

// Port name that selects the synthetic source instead of real hardware.
pub const TEST_PORT: &str = "TEST";

// Filter frequency that selects the 200 Hz start command on the serial device.
pub const DEFAULT_FILTER_FREQUENCY: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyLimits {
    pub min: u32,
    pub base: u32,
}

impl FrequencyLimits {
    // Accept `frequency` only when it reaches the minimum and divides the base clock.
    pub fn validate(&self, frequency: u32) -> Result<()> {
        if frequency == 0 {
            return Err(Error::Config("sampling frequency must be above 0 Hz".to_string()));
        }
        if frequency < self.min {
            return Err(Error::Config(format!(
                "sampling frequency {frequency} Hz is below the minimum of {} Hz",
                self.min
            )));
        }
        if self.base % frequency != 0 {
            return Err(Error::Config(format!(
                "sampling frequency {frequency} Hz is not a divisor of the {} Hz base clock",
                self.base
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub sampling_frequency: u32,
    pub filter_frequency: u32,
    pub device_id: String,
    // Upper bound on a single blocking read; also bounds stop latency.
    pub read_timeout: Duration,
    pub check_timeout: Duration,
    // Period of synthetic blocks. Serial blocks are paced by the device.
    pub block_interval: Duration,
    // Hex-dump every serial read at TRACE level.
    pub trace_raw: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            port: TEST_PORT.to_string(),
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            sampling_frequency: 200,
            filter_frequency: DEFAULT_FILTER_FREQUENCY,
            device_id: crate::device_id::DEFAULT_DEVICE_ID.to_string(),
            read_timeout: Duration::from_millis(100),
            check_timeout: Duration::from_secs(2),
            block_interval: Duration::from_secs(1),
            trace_raw: false,
        }
    }
}

impl ProtocolConfig {
    pub fn is_test_port(&self) -> bool {
        self.port.eq_ignore_ascii_case(TEST_PORT)
    }

    // Same settings on another port, e.g. the GPS link beside the ADC link.
    pub fn with_port(&self, port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..self.clone()
        }
    }
}
