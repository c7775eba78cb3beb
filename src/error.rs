use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    // Link cannot be opened, is locked, missing, or stopped answering
    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    // Illegal lifecycle transition; state is left unchanged
    #[error("state error: {0}")]
    State(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Monitored thread unresponsive or gone
    #[error("watchdog: {thread} thread {detail}")]
    Watchdog {
        thread: String,
        detail: String,
    },

    #[error("data integrity error: {0}")]
    Integrity(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn watchdog(thread: &str, detail: impl Into<String>) -> Self {
        Error::Watchdog {
            thread: thread.to_string(),
            detail: detail.into(),
        }
    }
}
