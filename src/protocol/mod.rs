mod block;
mod config;
pub mod gps;
pub mod serial;
pub mod synthetic;

pub use block::{BlockStats, CHANNELS, Sample, SampleBlock};
pub use config::{DEFAULT_FILTER_FREQUENCY, FrequencyLimits, ProtocolConfig, TEST_PORT};
pub use gps::{GpsDecoder, GpsFix};
pub use serial::{SERIAL_LIMITS, SerialProtocol};
pub use synthetic::{TEST_LIMITS, TestProtocol};

use crate::error::{Error, Result};
use crate::events::StatusSink;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};

// Byte transport under a serial protocol.
pub trait Link: Read + Write + Send {
    // Apply new port settings; links without settings accept anything.
    fn configure(&mut self, _config: &ProtocolConfig) -> Result<()> {
        Ok(())
    }

    // Drop bytes received but not yet read.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Link for Box<dyn SerialPort> {
    fn configure(&mut self, config: &ProtocolConfig) -> Result<()> {
        let apply = |port: &mut Box<dyn SerialPort>| -> serialport::Result<()> {
            port.set_baud_rate(config.baud_rate)?;
            port.set_data_bits(config.data_bits)?;
            port.set_stop_bits(config.stop_bits)?;
            port.set_parity(config.parity)?;
            port.set_flow_control(config.flow_control)?;
            port.set_timeout(config.read_timeout)
        };
        apply(self).map_err(|err| {
            Error::Transport(format!("reconfiguring {} failed: {err}", config.port))
        })
    }

    fn discard_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)
            .map_err(|err| Error::Transport(format!("clearing input buffer failed: {err}")))
    }
}

// Closed set of protocol variants behind one capability interface.
pub enum Protocol {
    Serial(SerialProtocol),
    Test(TestProtocol),
}

impl Protocol {
    // Open the variant the port name selects (`TEST` for the synthetic source).
    pub fn open(config: &ProtocolConfig, sink: &StatusSink) -> Result<Self> {
        if config.is_test_port() {
            TestProtocol::open(config.clone()).map(Protocol::Test)
        } else {
            SerialProtocol::open(config.clone(), sink.clone()).map(Protocol::Serial)
        }
    }

    pub fn description(&self) -> String {
        match self {
            Protocol::Serial(p) => p.description(),
            Protocol::Test(p) => p.description(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        match self {
            Protocol::Serial(p) => p.config(),
            Protocol::Test(p) => p.config(),
        }
    }

    pub fn check_ready(&mut self) -> Result<()> {
        match self {
            Protocol::Serial(p) => p.check_ready(),
            Protocol::Test(p) => p.check_ready(),
        }
    }

    // Handshake with a GPS receiver. The synthetic source has none to check.
    pub fn check_gps(&mut self) -> Result<()> {
        match self {
            Protocol::Serial(p) => p.check_gps(),
            Protocol::Test(_) => Ok(()),
        }
    }

    pub fn start_receiving(&mut self) -> Result<()> {
        match self {
            Protocol::Serial(p) => p.start_receiving(),
            Protocol::Test(p) => p.start_receiving(),
        }
    }

    pub fn stop_receiving(&mut self) -> Result<()> {
        match self {
            Protocol::Serial(p) => p.stop_receiving(),
            Protocol::Test(p) => p.stop_receiving(),
        }
    }

    pub fn read(&mut self) -> Result<Option<SampleBlock>> {
        match self {
            Protocol::Serial(p) => p.read(),
            Protocol::Test(p) => p.read(),
        }
    }

    // Serial only; the synthetic source never produces fixes.
    pub fn read_gps_fix(&mut self) -> Option<GpsFix> {
        match self {
            Protocol::Serial(p) => p.read_gps_fix(),
            Protocol::Test(_) => None,
        }
    }

    pub fn set_parameters(&mut self, config: ProtocolConfig) -> Result<()> {
        match self {
            Protocol::Serial(p) => p.set_parameters(config),
            Protocol::Test(p) => p.set_parameters(config),
        }
    }

    pub fn close(&mut self) {
        match self {
            Protocol::Serial(p) => p.close(),
            Protocol::Test(p) => p.close(),
        }
    }
}

pub fn port_names() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|err| Error::Transport(format!("enumerating serial ports failed: {err}")))?;
    Ok(ports
        .into_iter()
        .map(|info| info.port_name)
        .filter(|name| !name.is_empty())
        .collect())
}
