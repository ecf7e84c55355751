//! MUX framing protocol for the USB modem driver
//!
//! This crate implements the byte-exact framing that carries a control and a
//! data channel over a single USB bulk pipe, the frame check sequence it
//! relies on, and the QMAP flow-control messages exchanged on the control
//! channel. Everything here is pure: functions operate on caller-owned
//! buffers and never perform I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{decode_frame, encode_frame};
//!
//! let frame = encode_frame(b"hello", true, 2, 1).unwrap();
//! let decoded = decode_frame(&frame, true, 2, 1, true);
//! assert_eq!(decoded.payload(), Some(&b"hello"[..]));
//! assert_eq!(decoded.effective_len(), 5);
//! ```
//!
//! # MUX Disabled
//!
//! When the multiplexer is off, inbound buffers pass through untouched:
//!
//! ```
//! use protocol::decode_frame;
//!
//! let raw = [0x45, 0x00, 0x00, 0x1c];
//! let decoded = decode_frame(&raw, true, 2, 1, false);
//! assert_eq!(decoded.payload(), Some(&raw[..]));
//! ```

pub mod error;
pub mod fcs;
pub mod mux;
pub mod qmap;

pub use error::{ProtocolError, Result};
pub use fcs::{FrameKind, compute_fcs, verify_fcs};
pub use mux::{
    Decoded, DropReason, FLAG, MAX_DLCI, MAX_PAYLOAD, MuxChannels, UIH_CONTROL, decode_frame,
    encode_frame, frame_len,
};
pub use qmap::{FlowCommand, FlowControlMessage};
