use anyhow::{Context, Result};
use seismoreg::protocol::{TEST_PORT, port_names};

// List serial ports; the synthetic source is always available.
pub fn run_ports() -> Result<()> {
    let names = port_names().context("listing serial ports failed")?;
    if names.is_empty() {
        eprintln!("No serial ports found");
    }
    for name in names {
        println!("{name}");
    }
    println!("{TEST_PORT}");
    Ok(())
}
