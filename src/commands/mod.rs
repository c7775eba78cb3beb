// Command implementations split by subcommand.
pub mod ports;
pub mod run;

pub use ports::run_ports;
pub use run::run_mode;
