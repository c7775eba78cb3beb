use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Stop request raised by Ctrl-C. The run loop polls it and shuts down in order:
// worker first, then the writer, so queued blocks still reach disk.
#[derive(Clone, Debug)]
pub struct StopRequest {
    requested: Arc<AtomicBool>,
}

impl StopRequest {
    pub fn install() -> Result<Self> {
        let requested = Arc::new(AtomicBool::new(false));
        let requested_for_signal = Arc::clone(&requested);
        ctrlc::set_handler(move || {
            if requested_for_signal.swap(true, Ordering::SeqCst) {
                log::warn!("Already stopping, waiting for queued data to be written");
            } else {
                log::info!("Stop requested");
            }
        })
        .context("installing Ctrl-C handler failed")?;
        Ok(Self { requested })
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
