use crate::error::Error;
use crate::protocol::{BlockStats, GpsFix, SampleBlock};
use crate::worker::WorkerState;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Level::Trace => "TRACE",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Status { level: Level, message: String },
    State(WorkerState),
    // One block in read order, with running sample count
    Samples {
        block: SampleBlock,
        stats: BlockStats,
        total_samples: u64,
    },
    GpsFix(GpsFix),
    // GPS link absent or failed its check; acquisition continues without time fixes
    GpsUnavailable,
    Written { items: usize, path: PathBuf },
    Finished { total_samples: u64, blocks: u64 },
    // A monitored thread missed its heartbeat window
    Hung { thread: String, silent_for: Duration },
}

// Cloneable logging sink injected into every component.
//
// Every message goes through the `log` facade and, when a channel is attached,
// is also published as `Event::Status`.
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: Option<Sender<Event>>,
}

impl StatusSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    // Sink plus the receiving end of a fresh unbounded event channel.
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    pub fn publish(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            log::trace!("event consumer is gone, event dropped");
        }
    }

    pub fn message(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::Trace => log::trace!("{message}"),
            Level::Info => log::info!("{message}"),
            Level::Warning => log::warn!("{message}"),
            Level::Error => log::error!("{message}"),
        }
        self.publish(Event::Status { level, message });
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.message(Level::Trace, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.message(Level::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.message(Level::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.message(Level::Error, message);
    }

    pub fn report(&self, err: &Error) {
        self.error(err.to_string());
    }
}
