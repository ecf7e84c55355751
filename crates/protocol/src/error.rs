//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer too small to hold the octets an operation needs
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Payload exceeds what the length field can express
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// DLCI outside the 6-bit address range
    #[error("Invalid DLCI {0} (must be 0..=63)")]
    InvalidDlci(u8),

    /// QMAP control message with an unknown command name
    #[error("Unknown QMAP command {0:#04x}")]
    UnknownCommand(u8),

    /// QMAP packet that is not a control packet
    #[error("Not a QMAP control packet")]
    NotControlPacket,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 3,
            available: 1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("needed 3"));
        assert!(msg.contains("got 1"));
    }

    #[test]
    fn test_frame_too_large_error() {
        let err = ProtocolError::FrameTooLarge {
            size: 0x1_0000,
            max: 0x7FFF,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Frame too large"));
    }
}
