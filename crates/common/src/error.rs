//! Errors crossing the worker bridge
//!
//! The driver's own error type stays inside the worker thread; replies to
//! the front-end carry this flattened form.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure, kept structured so callers can spot disconnects
    #[error("USB error: {0}")]
    Usb(#[from] crate::usb_types::UsbError),

    /// Any other driver-core failure, rendered to text
    #[error("Driver error: {0}")]
    Driver(String),

    /// The worker thread is gone or its queue is closed
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The device is no longer reachable
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Usb(e) if e.is_disconnect())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
