//! MUX frame encoding and decoding
//!
//! A control channel and a data channel share one USB bulk pipe. Each
//! payload travels in a flag-delimited UIH frame:
//!
//! ```text
//! [0xF9][address][0xEF][length: 1 or 2 octets][payload][FCS][0xF9]
//! ```
//!
//! The address octet is `(DLCI << 2) | 0x01`. The length field uses the EA
//! bit: a single octet `(len << 1) | 1` for payloads below 0x80, otherwise
//! `(len & 0x7F) << 1` followed by `len >> 7`.
//!
//! Decoding never copies: it returns a view into the caller's buffer.

use crate::error::{ProtocolError, Result};
use crate::fcs::{FrameKind, compute_fcs, header_len, length_octets, verify_fcs};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Opening and closing flag octet
pub const FLAG: u8 = 0xF9;

/// Control octet for UIH frames
pub const UIH_CONTROL: u8 = 0xEF;

/// Largest payload the two-octet length field can carry
pub const MAX_PAYLOAD: usize = 0x7FFF;

/// Largest DLCI that fits the six address bits
pub const MAX_DLCI: u8 = 63;

/// Flag, address, control, FCS, flag
const FRAME_OVERHEAD: usize = 5;

/// Address octet for `dlci` with the EA bit set
#[inline]
pub fn address_octet(dlci: u8) -> u8 {
    (dlci << 2) | 0x01
}

/// Encode `payload` as a UIH frame on the data or control DLCI
///
/// The returned buffer holds the complete frame; its length is the total
/// frame length including both flags.
///
/// Payloads are limited to [`MAX_PAYLOAD`] (0x7FFF) rather than 0xFFFF: the
/// two EA length octets carry 7 + 8 bits, so a longer length cannot be
/// written or read back.
pub fn encode_frame(payload: &[u8], is_data: bool, data_dlci: u8, ctrl_dlci: u8) -> Result<Bytes> {
    let dlci = if is_data { data_dlci } else { ctrl_dlci };
    if dlci > MAX_DLCI {
        return Err(ProtocolError::InvalidDlci(dlci));
    }

    let len = payload.len();
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }

    let length_field = if len < 0x80 { 1 } else { 2 };
    let mut frame = BytesMut::with_capacity(FRAME_OVERHEAD + length_field + len);

    frame.put_u8(FLAG);
    frame.put_u8(address_octet(dlci));
    frame.put_u8(UIH_CONTROL);
    if length_field == 1 {
        frame.put_u8(((len as u8) << 1) | 0x01);
    } else {
        frame.put_u8(((len & 0x7F) as u8) << 1);
        frame.put_u8((len >> 7) as u8);
    }

    let fcs = compute_fcs(FrameKind::Uih, &frame[1..])?;

    frame.put_slice(payload);
    frame.put_u8(fcs);
    frame.put_u8(FLAG);

    Ok(frame.freeze())
}

/// Why a well-formed-looking frame was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame for DLCI 0, the multiplexer's own control channel
    ControlChannel,
    /// Frame addressed to a DLCI other than the expected one
    DlciMismatch { expected: u8, found: u8 },
    /// Length field inconsistent with the received bytes
    Truncated,
    /// Header check failed
    FcsMismatch,
}

/// Result of decoding one inbound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// MUX disabled: the whole buffer is payload
    Passthrough(&'a [u8]),
    /// Payload view of a frame on the expected DLCI
    Payload { dlci: u8, data: &'a [u8] },
    /// Buffer does not start with a flag; `len` is the original length
    NotAFrame { len: usize },
    /// Frame discarded; effective length is zero
    Dropped(DropReason),
}

impl<'a> Decoded<'a> {
    /// Payload bytes, if any were extracted
    pub fn payload(&self) -> Option<&'a [u8]> {
        match *self {
            Decoded::Passthrough(data) | Decoded::Payload { data, .. } => Some(data),
            Decoded::NotAFrame { .. } | Decoded::Dropped(_) => None,
        }
    }

    /// Number of bytes the caller should treat as received
    pub fn effective_len(&self) -> usize {
        match *self {
            Decoded::Passthrough(data) | Decoded::Payload { data, .. } => data.len(),
            Decoded::NotAFrame { len } => len,
            Decoded::Dropped(_) => 0,
        }
    }
}

/// FCS rule for a received control octet (poll/final bit masked)
fn frame_kind(control: u8) -> FrameKind {
    match control & !0x10 {
        0xEF => FrameKind::Uih,
        0x03 => FrameKind::Ui,
        _ => FrameKind::Control,
    }
}

/// Decode one inbound buffer for the data or control channel
pub fn decode_frame(
    buffer: &[u8],
    is_data: bool,
    data_dlci: u8,
    ctrl_dlci: u8,
    mux_enabled: bool,
) -> Decoded<'_> {
    if !mux_enabled {
        return Decoded::Passthrough(buffer);
    }

    if buffer.first() != Some(&FLAG) {
        return Decoded::NotAFrame { len: buffer.len() };
    }

    if buffer.len() < 4 {
        return Decoded::Dropped(DropReason::Truncated);
    }

    let dlci = buffer[1] >> 2;
    if dlci == 0 {
        return Decoded::Dropped(DropReason::ControlChannel);
    }

    let expected = if is_data { data_dlci } else { ctrl_dlci };
    if dlci != expected {
        return Decoded::Dropped(DropReason::DlciMismatch {
            expected,
            found: dlci,
        });
    }

    let Ok(header) = header_len(&buffer[1..]) else {
        return Decoded::Dropped(DropReason::Truncated);
    };

    let payload_len = payload_len(buffer);
    if payload_len >= buffer.len() {
        return Decoded::Dropped(DropReason::Truncated);
    }

    let start = 1 + header;
    let end = start + payload_len;
    // FCS octet must follow the payload
    if end >= buffer.len() {
        return Decoded::Dropped(DropReason::Truncated);
    }

    let kind = frame_kind(buffer[2]);
    let covered = match kind {
        FrameKind::Ui => &buffer[1..end],
        FrameKind::Uih | FrameKind::Control => &buffer[1..start],
    };
    if !verify_fcs(kind, covered, buffer[end]) {
        return Decoded::Dropped(DropReason::FcsMismatch);
    }

    Decoded::Payload {
        dlci,
        data: &buffer[start..end],
    }
}

/// Payload length from the length field; the header must be complete
fn payload_len(buffer: &[u8]) -> usize {
    if length_octets(buffer[3]) == 1 {
        (buffer[3] >> 1) as usize
    } else {
        ((buffer[3] >> 1) as usize) | ((buffer[4] as usize) << 7)
    }
}

/// Total length of the frame opening `buffer`, both flags included
///
/// Used to split a bundled transfer into frames. Returns `None` when the
/// buffer does not start with a flag or its header is incomplete; the
/// result may exceed `buffer.len()` for a truncated frame.
pub fn frame_len(buffer: &[u8]) -> Option<usize> {
    if buffer.first() != Some(&FLAG) {
        return None;
    }
    let header = header_len(buffer.get(1..)?).ok()?;
    Some(1 + header + payload_len(buffer) + 2)
}

/// DLCI assignment for the two logical channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxChannels {
    /// DLCI of the control channel
    pub control_dlci: u8,
    /// DLCI of the data channel
    pub data_dlci: u8,
}

impl Default for MuxChannels {
    fn default() -> Self {
        Self {
            control_dlci: 1,
            data_dlci: 2,
        }
    }
}

impl MuxChannels {
    /// Encode `payload` for the data or control channel
    pub fn encode(&self, payload: &[u8], is_data: bool) -> Result<Bytes> {
        encode_frame(payload, is_data, self.data_dlci, self.control_dlci)
    }

    /// Decode an inbound buffer for the data or control channel
    pub fn decode<'a>(&self, buffer: &'a [u8], is_data: bool, mux_enabled: bool) -> Decoded<'a> {
        decode_frame(buffer, is_data, self.data_dlci, self.control_dlci, mux_enabled)
    }
}
