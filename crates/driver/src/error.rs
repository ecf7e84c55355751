//! Driver error types

use common::UsbError;
use protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the driver core
///
/// Transport failures keep the raw `UsbError` so callers can tell them apart
/// from logic errors such as a power veto.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transport call failed
    #[error("transport failure: {0}")]
    Transport(#[from] UsbError),

    /// Descriptor failed validation or could not be parsed
    #[error("invalid {kind} descriptor: {reason}")]
    InvalidDescriptor { kind: &'static str, reason: String },

    /// A client is already attached
    #[error("device busy")]
    DeviceBusy,

    /// Device is removed, not started, or found broken
    #[error("delete pending")]
    DeletePending,

    /// Power-down refused because the device is in use
    #[error("power request vetoed: {0}")]
    PowerVeto(String),

    /// Lifecycle event not allowed in the current state
    #[error("invalid state: cannot {event} while {from}")]
    InvalidState {
        from: &'static str,
        event: &'static str,
    },

    /// Every self-originated power request slot is pending
    #[error("self-originated power request pool exhausted")]
    PowerPoolExhausted,

    /// Interface table or pipe table overflow
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Pipes do not match any known model
    #[error("unrecognized device model")]
    UnrecognizedModel,

    /// Frame encoding failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Key-value store failure
    #[error("store error: {0}")]
    Store(String),

    /// Service loop could not be started or stopped
    #[error("service loop {name} failed: {reason}")]
    Service { name: &'static str, reason: String },
}

impl DriverError {
    /// Errors after which the session must be torn down
    pub fn is_device_fatal(&self) -> bool {
        match self {
            DriverError::DeletePending
            | DriverError::InvalidDescriptor { .. }
            | DriverError::UnrecognizedModel => true,
            DriverError::Transport(e) => e.is_disconnect(),
            _ => false,
        }
    }

    /// Power manager veto rather than a device fault
    pub fn is_veto(&self) -> bool {
        matches!(self, DriverError::PowerVeto(_))
    }
}

impl From<DriverError> for common::Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Transport(e) => common::Error::Usb(e),
            other => common::Error::Driver(other.to_string()),
        }
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
