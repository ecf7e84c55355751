//! QMAP flow-control messages carried on the MUX control channel
//!
//! # Wire Format
//!
//! ```text
//! [cd|pad: u8][mux_id: u8][pkt_len: u16 BE]                    QMAP header
//! [cmd_name: u8][cmd_type: u8][reserved: u16]
//! [transaction_id: u32 BE][flow_ctrl_seq_num_ip: u32 BE][qos_id: u32 BE]
//! ```
//!
//! The command bit (0x80) of the first header octet marks a control packet.
//! `cmd_type` 0 is a request; any other value acknowledges one.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Command bit of the first QMAP header octet
const COMMAND_BIT: u8 = 0x80;

/// QMAP header length
const HEADER_LEN: usize = 4;

/// Flow-control body length
const BODY_LEN: usize = 16;

/// Encoded size of a flow-control message
pub const FLOW_CONTROL_LEN: usize = HEADER_LEN + BODY_LEN;

/// Request type value
pub const CMD_TYPE_REQUEST: u8 = 0;

/// Acknowledgement type value
pub const CMD_TYPE_ACK: u8 = 1;

/// Flow-control command names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowCommand {
    /// Stop sending on the data channel
    Pause,
    /// Resume sending on the data channel
    Resume,
}

impl FlowCommand {
    /// Wire value of the command name
    pub fn code(self) -> u8 {
        match self {
            FlowCommand::Pause => 1,
            FlowCommand::Resume => 2,
        }
    }

    /// Parse a wire command name
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(FlowCommand::Pause),
            2 => Ok(FlowCommand::Resume),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Flow-control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlMessage {
    pub mux_id: u8,
    pub command: FlowCommand,
    pub transaction_id: u32,
    pub cmd_type: u8,
    pub flow_ctrl_seq_num_ip: u32,
    pub qos_id: u32,
}

impl FlowControlMessage {
    /// True for a request that the peer expects to be acknowledged
    pub fn is_request(&self) -> bool {
        self.cmd_type == CMD_TYPE_REQUEST
    }

    /// Acknowledgement for this request
    pub fn ack(&self) -> Self {
        Self {
            cmd_type: CMD_TYPE_ACK,
            ..*self
        }
    }

    /// Serialize to the fixed wire layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FLOW_CONTROL_LEN);
        // Writes into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u8(COMMAND_BIT)?;
        out.write_u8(self.mux_id)?;
        out.write_u16::<BigEndian>(BODY_LEN as u16)?;
        out.write_u8(self.command.code())?;
        out.write_u8(self.cmd_type & 0x03)?;
        out.write_u16::<BigEndian>(0)?;
        out.write_u32::<BigEndian>(self.transaction_id)?;
        out.write_u32::<BigEndian>(self.flow_ctrl_seq_num_ip)?;
        out.write_u32::<BigEndian>(self.qos_id)?;
        Ok(())
    }

    /// Parse a message from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FLOW_CONTROL_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: FLOW_CONTROL_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0] & COMMAND_BIT == 0 {
            return Err(ProtocolError::NotControlPacket);
        }

        let mut cursor = Cursor::new(&bytes[1..FLOW_CONTROL_LEN]);
        let (mux_id, cmd_name, cmd_type, transaction_id, flow_ctrl_seq_num_ip, qos_id) =
            read_body(&mut cursor).map_err(|_| ProtocolError::BufferTooSmall {
                needed: FLOW_CONTROL_LEN,
                available: bytes.len(),
            })?;

        Ok(Self {
            mux_id,
            command: FlowCommand::from_code(cmd_name)?,
            transaction_id,
            cmd_type,
            flow_ctrl_seq_num_ip,
            qos_id,
        })
    }
}

/// Header remainder and body fields, in wire order
type RawBody = (u8, u8, u8, u32, u32, u32);

fn read_body(cursor: &mut Cursor<&[u8]>) -> std::io::Result<RawBody> {
    let mux_id = cursor.read_u8()?;
    let _pkt_len = cursor.read_u16::<BigEndian>()?;
    let cmd_name = cursor.read_u8()?;
    let cmd_type = cursor.read_u8()? & 0x03;
    let _reserved = cursor.read_u16::<BigEndian>()?;
    let transaction_id = cursor.read_u32::<BigEndian>()?;
    let seq = cursor.read_u32::<BigEndian>()?;
    let qos_id = cursor.read_u32::<BigEndian>()?;
    Ok((mux_id, cmd_name, cmd_type, transaction_id, seq, qos_id))
}
