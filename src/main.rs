mod args;
mod commands;
mod shared;

use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};

use args::{AppCommand, Cli};
use commands::{run_mode, run_ports};

// Top-level entrypoint: set up logging, parse CLI args and dispatch to a command module.
fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        AppCommand::Run(args) => run_mode(args),
        AppCommand::Ports => run_ports(),
    }
}
