use clap::{Args, Parser, Subcommand, ValueEnum};
use seismoreg::device_id::DEFAULT_DEVICE_ID;
use seismoreg::protocol::{DEFAULT_FILTER_FREQUENCY, TEST_PORT};
use seismoreg::writer::{DEFAULT_PATTERN, DEFAULT_PREFIX, DEFAULT_SUFFIX};
use std::path::PathBuf;

// CLI root definition.
#[derive(Parser, Debug)]
#[command(name = "seismoreg", version)]
#[command(about = "Seismic ADC recorder with GPS timing and rotating data files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AppCommand,
}

// Subcommands map to one module each under src/commands/.
#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Acquire samples and write them to rotating data files
    Run(RunArgs),
    /// List serial ports present on this host
    Ports,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// ADC serial port, or TEST for the synthetic source
    #[arg(long, env = "SEISMOREG_PORT", default_value = TEST_PORT)]
    pub port: String,
    /// GPS serial port; acquisition runs without time fixes when absent
    #[arg(long, env = "SEISMOREG_GPS_PORT")]
    pub gps_port: Option<String>,
    #[arg(long, default_value_t = 115_200)]
    pub baud_rate: u32,
    #[arg(long, value_enum, default_value_t = DataBitsArg::Eight)]
    pub data_bits: DataBitsArg,
    #[arg(long, value_enum, default_value_t = ParityArg::None)]
    pub parity: ParityArg,
    #[arg(long, value_enum, default_value_t = StopBitsArg::One)]
    pub stop_bits: StopBitsArg,
    #[arg(long, value_enum, default_value_t = FlowControlArg::None)]
    pub flow_control: FlowControlArg,
    #[arg(long, default_value_t = 100)]
    pub read_timeout_ms: u64,
    /// Samples per second written to disk
    #[arg(long, short = 'f', default_value_t = 200)]
    pub sampling_frequency: u32,
    /// Hardware filter, 50 or 200 Hz
    #[arg(long, default_value_t = DEFAULT_FILTER_FREQUENCY)]
    pub filter_frequency: u32,
    /// Synthetic source only: time covered by one block
    #[arg(long, default_value_t = 1_000)]
    pub block_interval_ms: u64,
    /// Plain text file holding the device id
    #[arg(long, env = "SEISMOREG_DEVICE_ID_FILE")]
    pub device_id_file: Option<PathBuf>,
    /// Device id used when the file is missing or unusable
    #[arg(long, default_value = DEFAULT_DEVICE_ID)]
    pub device_id: String,
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,
    /// File name pattern; macros {year} {month} {day} {hour} {minute} {second} {filter} {freq} {device}
    #[arg(long, default_value = DEFAULT_PATTERN)]
    pub pattern: String,
    #[arg(long, default_value = DEFAULT_SUFFIX)]
    pub suffix: String,
    #[arg(long, value_enum, default_value_t = RotationArg::Automatic)]
    pub rotation: RotationArg,
    #[arg(long, default_value_t = 3_600)]
    pub rotation_interval_secs: u64,
    /// Manual modes: trigger a write every N seconds (otherwise only at exit)
    #[arg(long)]
    pub write_every_secs: Option<u64>,
    /// Keep at most N blocks while files cannot be written (default: keep all)
    #[arg(long)]
    pub retain_blocks: Option<usize>,
    #[arg(long, default_value_t = 2_000)]
    pub stop_timeout_ms: u64,
    /// A thread silent for longer than this is reported as hung
    #[arg(long, default_value_t = 5_000)]
    pub watchdog_window_ms: u64,
    /// Stop after N seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,
    /// Defaults to .seismoreg.lock in the output directory
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    pub stats_interval_secs: u64,
    /// Hex dump every serial read at TRACE level
    #[arg(long, default_value_t = false)]
    pub trace_raw: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBitsArg {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityArg {
    None,
    Odd,
    Even,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBitsArg {
    One,
    Two,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlArg {
    None,
    Software,
    Hardware,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationArg {
    Manual,
    Automatic,
    ManualAuto,
}

impl From<DataBitsArg> for serialport::DataBits {
    fn from(value: DataBitsArg) -> Self {
        match value {
            DataBitsArg::Five => serialport::DataBits::Five,
            DataBitsArg::Six => serialport::DataBits::Six,
            DataBitsArg::Seven => serialport::DataBits::Seven,
            DataBitsArg::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<ParityArg> for serialport::Parity {
    fn from(value: ParityArg) -> Self {
        match value {
            ParityArg::None => serialport::Parity::None,
            ParityArg::Odd => serialport::Parity::Odd,
            ParityArg::Even => serialport::Parity::Even,
        }
    }
}

impl From<StopBitsArg> for serialport::StopBits {
    fn from(value: StopBitsArg) -> Self {
        match value {
            StopBitsArg::One => serialport::StopBits::One,
            StopBitsArg::Two => serialport::StopBits::Two,
        }
    }
}

impl From<FlowControlArg> for serialport::FlowControl {
    fn from(value: FlowControlArg) -> Self {
        match value {
            FlowControlArg::None => serialport::FlowControl::None,
            FlowControlArg::Software => serialport::FlowControl::Software,
            FlowControlArg::Hardware => serialport::FlowControl::Hardware,
        }
    }
}
