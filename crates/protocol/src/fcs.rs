//! Frame check sequence for MUX frames
//!
//! The FCS is a CRC-8 over polynomial 0x07, processed in reversed bit order
//! through a 256-entry lookup table (3GPP TS 27.010 style). Which octets are
//! covered depends on the frame kind:
//!
//! - `Control` and `Uih`: address, control and the 1 or 2 length octets
//! - `Ui`: the same header octets plus the whole payload
//!
//! # Usage
//!
//! ```
//! use protocol::fcs::{FrameKind, compute_fcs, verify_fcs};
//!
//! let header = [0x01, 0xEF, 0x01];
//! let fcs = compute_fcs(FrameKind::Control, &header).unwrap();
//! assert!(verify_fcs(FrameKind::Control, &header, fcs));
//! ```

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Initial value of the running CRC
const FCS_INIT: u8 = 0xFF;

/// Reversed CRC-8 table for polynomial x^8 + x^2 + x + 1
pub const CRC_TABLE: [u8; 256] = [
    0x00, 0x91, 0xE3, 0x72, 0x07, 0x96, 0xE4, 0x75, 0x0E, 0x9F, 0xED, 0x7C, 0x09, 0x98, 0xEA, 0x7B,
    0x1C, 0x8D, 0xFF, 0x6E, 0x1B, 0x8A, 0xF8, 0x69, 0x12, 0x83, 0xF1, 0x60, 0x15, 0x84, 0xF6, 0x67,
    0x38, 0xA9, 0xDB, 0x4A, 0x3F, 0xAE, 0xDC, 0x4D, 0x36, 0xA7, 0xD5, 0x44, 0x31, 0xA0, 0xD2, 0x43,
    0x24, 0xB5, 0xC7, 0x56, 0x23, 0xB2, 0xC0, 0x51, 0x2A, 0xBB, 0xC9, 0x58, 0x2D, 0xBC, 0xCE, 0x5F,
    0x70, 0xE1, 0x93, 0x02, 0x77, 0xE6, 0x94, 0x05, 0x7E, 0xEF, 0x9D, 0x0C, 0x79, 0xE8, 0x9A, 0x0B,
    0x6C, 0xFD, 0x8F, 0x1E, 0x6B, 0xFA, 0x88, 0x19, 0x62, 0xF3, 0x81, 0x10, 0x65, 0xF4, 0x86, 0x17,
    0x48, 0xD9, 0xAB, 0x3A, 0x4F, 0xDE, 0xAC, 0x3D, 0x46, 0xD7, 0xA5, 0x34, 0x41, 0xD0, 0xA2, 0x33,
    0x54, 0xC5, 0xB7, 0x26, 0x53, 0xC2, 0xB0, 0x21, 0x5A, 0xCB, 0xB9, 0x28, 0x5D, 0xCC, 0xBE, 0x2F,
    0xE0, 0x71, 0x03, 0x92, 0xE7, 0x76, 0x04, 0x95, 0xEE, 0x7F, 0x0D, 0x9C, 0xE9, 0x78, 0x0A, 0x9B,
    0xFC, 0x6D, 0x1F, 0x8E, 0xFB, 0x6A, 0x18, 0x89, 0xF2, 0x63, 0x11, 0x80, 0xF5, 0x64, 0x16, 0x87,
    0xD8, 0x49, 0x3B, 0xAA, 0xDF, 0x4E, 0x3C, 0xAD, 0xD6, 0x47, 0x35, 0xA4, 0xD1, 0x40, 0x32, 0xA3,
    0xC4, 0x55, 0x27, 0xB6, 0xC3, 0x52, 0x20, 0xB1, 0xCA, 0x5B, 0x29, 0xB8, 0xCD, 0x5C, 0x2E, 0xBF,
    0x90, 0x01, 0x73, 0xE2, 0x97, 0x06, 0x74, 0xE5, 0x9E, 0x0F, 0x7D, 0xEC, 0x99, 0x08, 0x7A, 0xEB,
    0x8C, 0x1D, 0x6F, 0xFE, 0x8B, 0x1A, 0x68, 0xF9, 0x82, 0x13, 0x61, 0xF0, 0x85, 0x14, 0x66, 0xF7,
    0xA8, 0x39, 0x4B, 0xDA, 0xAF, 0x3E, 0x4C, 0xDD, 0xA6, 0x37, 0x45, 0xD4, 0xA1, 0x30, 0x42, 0xD3,
    0xB4, 0x25, 0x57, 0xC6, 0xB3, 0x22, 0x50, 0xC1, 0xBA, 0x2B, 0x59, 0xC8, 0xBD, 0x2C, 0x5E, 0xCF,
];

/// MUX frame kinds that carry an FCS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Control frames (SABM, UA, DM, DISC)
    Control,
    /// Unnumbered information with header check only
    Uih,
    /// Unnumbered information, FCS covers the payload too
    Ui,
}

/// Number of length octets announced by the EA bit of `octet`
#[inline]
pub fn length_octets(octet: u8) -> usize {
    if octet & 0x01 == 0x01 { 1 } else { 2 }
}

/// Number of header octets (address, control, length) covered for Control/UIH
pub fn header_len(buffer: &[u8]) -> Result<usize> {
    if buffer.len() < 3 {
        return Err(ProtocolError::BufferTooSmall {
            needed: 3,
            available: buffer.len(),
        });
    }
    let len = 2 + length_octets(buffer[2]);
    if buffer.len() < len {
        return Err(ProtocolError::BufferTooSmall {
            needed: len,
            available: buffer.len(),
        });
    }
    Ok(len)
}

/// Compute the FCS of a frame starting at the address octet
///
/// `buffer` holds address, control, length octet(s) and, for `Ui`, the
/// payload. Flags are not part of the buffer.
pub fn compute_fcs(kind: FrameKind, buffer: &[u8]) -> Result<u8> {
    let covered = match kind {
        FrameKind::Control | FrameKind::Uih => &buffer[..header_len(buffer)?],
        FrameKind::Ui => {
            header_len(buffer)?;
            buffer
        }
    };

    let running = covered
        .iter()
        .fold(FCS_INIT, |fcs, &byte| CRC_TABLE[(fcs ^ byte) as usize]);

    Ok(0xFF - running)
}

/// Verify an FCS; any computation failure counts as a mismatch
#[inline]
pub fn verify_fcs(kind: FrameKind, buffer: &[u8], expected: u8) -> bool {
    compute_fcs(kind, buffer).is_ok_and(|fcs| fcs == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_polynomial() {
        for (i, &entry) in CRC_TABLE.iter().enumerate() {
            let mut crc = i as u8;
            for _ in 0..8 {
                crc = if crc & 1 == 1 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
            }
            assert_eq!(entry, crc, "table entry {}", i);
        }
    }

    #[test]
    fn test_golden_control_header() {
        // Zero-length control frame on DLCI 0
        assert_eq!(compute_fcs(FrameKind::Control, &[0x01, 0xEF, 0x01]), Ok(0x94));
        // SABM on DLCI 0, the 27.010 reference value
        assert_eq!(compute_fcs(FrameKind::Control, &[0x03, 0x3F, 0x01]), Ok(0x1C));
    }

    #[test]
    fn test_two_octet_length_covered() {
        // EA bit clear: both length octets are part of the header
        let one = compute_fcs(FrameKind::Uih, &[0x05, 0xEF, 0x06, 0x02]).unwrap();
        assert_eq!(one, 0x99);
        let other = compute_fcs(FrameKind::Uih, &[0x05, 0xEF, 0x06, 0x03]).unwrap();
        assert_ne!(one, other);
    }

    #[test]
    fn test_uih_ignores_payload() {
        let a = compute_fcs(FrameKind::Uih, &[0x05, 0xEF, 0x05, 0xAA, 0xBB]).unwrap();
        let b = compute_fcs(FrameKind::Uih, &[0x05, 0xEF, 0x05, 0x00, 0x00]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 0x51);
    }

    #[test]
    fn test_ui_covers_payload() {
        let a = compute_fcs(FrameKind::Ui, &[0x05, 0x03, 0x05, 0xAA, 0xBB]).unwrap();
        let b = compute_fcs(FrameKind::Ui, &[0x05, 0x03, 0x05, 0x00, 0x00]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_buffer_fails() {
        assert!(compute_fcs(FrameKind::Control, &[]).is_err());
        assert!(compute_fcs(FrameKind::Uih, &[0x05, 0xEF]).is_err());
        // EA clear announces a second length octet that is missing
        assert!(compute_fcs(FrameKind::Uih, &[0x05, 0xEF, 0x00]).is_err());
        assert!(!verify_fcs(FrameKind::Uih, &[], 0x00));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let header = [0x09, 0xEF, 0x21];
        let fcs = compute_fcs(FrameKind::Uih, &header).unwrap();
        assert!(verify_fcs(FrameKind::Uih, &header, fcs));
        assert!(!verify_fcs(FrameKind::Uih, &[0x0D, 0xEF, 0x21], fcs));
    }
}
