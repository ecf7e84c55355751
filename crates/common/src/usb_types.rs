//! USB and power types shared by the driver and its front-end

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// GUID carried by the vendor functional descriptor when the vendor
/// feature set is available
pub const VENDOR_FEATURE_GUID: [u8; 16] = [
    0x3E, 0x1F, 0x5C, 0x84, 0x7A, 0x29, 0x4B, 0x6D, 0x90, 0x8E, 0x51, 0xC3, 0x0A, 0xD7, 0x62, 0xF4,
];

/// USB transfer error
///
/// Status reported by the transport for any descriptor read, reset or
/// transfer. `NoDevice` and `NotFound` are the two "device gone" statuses
/// the health check looks for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device not connected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("no such device")]
    NotFound,
    /// Device is busy
    #[error("device busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// True when the status means the device has left the bus
    pub fn is_disconnect(&self) -> bool {
        matches!(self, UsbError::NoDevice | UsbError::NotFound)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UsbSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    #[default]
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl UsbSpeed {
    /// SuperSpeed or faster was negotiated
    pub fn is_super_speed(self) -> bool {
        matches!(self, UsbSpeed::Super | UsbSpeed::SuperPlus)
    }
}

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// Device power level, ordered from fully on to off
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum DevicePower {
    #[default]
    Unspecified,
    D0,
    D1,
    D2,
    D3,
}

impl DevicePower {
    /// D1, D2 or D3
    pub fn is_low_power(self) -> bool {
        self >= DevicePower::D1
    }
}

/// System power level, ordered from working to shutdown
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum SystemPower {
    #[default]
    Unspecified,
    Working,
    Sleeping1,
    Sleeping2,
    Sleeping3,
    Hibernate,
    Shutdown,
}

impl SystemPower {
    /// Working, or not yet reported
    pub fn is_awake(self) -> bool {
        self <= SystemPower::Working
    }

    /// S3 or deeper: the device will lose power
    pub fn is_deep_sleep(self) -> bool {
        self >= SystemPower::Sleeping3
    }
}

/// Pipes whose completion status is tracked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PipeKind {
    Control,
    Interrupt,
    Input,
    Output,
}

impl PipeKind {
    pub const ALL: [PipeKind; 4] = [
        PipeKind::Control,
        PipeKind::Interrupt,
        PipeKind::Input,
        PipeKind::Output,
    ];
}

/// Device model classification from the discovered pipes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ModelType {
    /// Bulk in/out plus an interrupt pipe
    Net,
    /// Bulk in/out without interrupt, or a MUX-derived channel
    NetLike,
    /// Unrecognized
    #[default]
    None,
}
