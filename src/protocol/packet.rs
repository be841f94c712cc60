//! Request/response payload layout.
//!
//! ```text
//! u8   kind      0 = request, 1 = response
//! u32  id        little-endian
//! request:   string command, value args
//! response:  u8 status; 0 = ok followed by value result,
//!                       1 = error followed by string message
//! ```
//!
//! A payload with bytes left over after the packet is malformed.

use super::byte_buffer::ByteBuffer;
use super::error::{ProtocolError, ProtocolResult};
use super::value::{Value, read_string};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// One decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub body: PacketBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Request { command: String, args: Value },
    /// `Err` carries the worker's error message for this request only.
    Response(Result<Value, String>),
}

impl Packet {
    pub fn request(id: u32, command: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            body: PacketBody::Request {
                command: command.into(),
                args,
            },
        }
    }

    pub fn response(id: u32, outcome: Result<Value, String>) -> Self {
        Self {
            id,
            body: PacketBody::Response(outcome),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, PacketBody::Request { .. })
    }
}

/// Encode a packet into a payload (without the frame length prefix).
pub fn encode_packet(packet: &Packet) -> ProtocolResult<Vec<u8>> {
    let mut bb = ByteBuffer::new();
    match &packet.body {
        PacketBody::Request { command, args } => {
            bb.write8(KIND_REQUEST);
            bb.write32(packet.id);
            bb.write(command.as_bytes())?;
            args.encode(&mut bb)?;
        }
        PacketBody::Response(Ok(result)) => {
            bb.write8(KIND_RESPONSE);
            bb.write32(packet.id);
            bb.write8(STATUS_OK);
            result.encode(&mut bb)?;
        }
        PacketBody::Response(Err(message)) => {
            bb.write8(KIND_RESPONSE);
            bb.write32(packet.id);
            bb.write8(STATUS_ERROR);
            bb.write(message.as_bytes())?;
        }
    }
    Ok(bb.into_vec())
}

/// Decode a complete payload.
pub fn decode_packet(payload: &[u8]) -> ProtocolResult<Packet> {
    let mut bb = ByteBuffer::from_bytes(payload.to_vec());
    let kind = bb.read8()?;
    let id = bb.read32()?;
    let body = match kind {
        KIND_REQUEST => {
            let command = read_string(&mut bb)?;
            let args = Value::decode(&mut bb)?;
            PacketBody::Request { command, args }
        }
        KIND_RESPONSE => match bb.read8()? {
            STATUS_OK => PacketBody::Response(Ok(Value::decode(&mut bb)?)),
            STATUS_ERROR => PacketBody::Response(Err(read_string(&mut bb)?)),
            status => return Err(ProtocolError::InvalidKind(status)),
        },
        kind => return Err(ProtocolError::InvalidKind(kind)),
    };
    if bb.remaining() != 0 {
        return Err(ProtocolError::TrailingBytes(bb.remaining()));
    }
    Ok(Packet { id, body })
}
