//! Seismic recorder core: ADC/GPS protocols, the acquisition worker and the
//! rotating file writer, tied together by an event channel.

pub mod device_id;
pub mod error;
pub mod events;
pub mod protocol;
pub mod watchdog;
pub mod worker;
pub mod writer;

pub use error::{Error, Result};
pub use events::{Event, Level, StatusSink};
