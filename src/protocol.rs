//! Wire protocol shared by the host and the worker.
//!
//! # Module Structure
//!
//! - `byte_buffer` - Growable, cursor-tracked buffer with the primitive reads/writes
//! - `value` - Tagged union carried as command arguments and results
//! - `packet` - Request/response payload layout
//! - `frame` - 4-byte little-endian length prefix framing and stream reassembly
//!
//! Every message in either direction is `[u32 LE length][payload]`. The frame
//! layer never looks inside the payload; the packet layer never sees the prefix.

mod byte_buffer;
mod error;
mod frame;
mod packet;
mod value;

pub use byte_buffer::ByteBuffer;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, Frames, LENGTH_PREFIX_SIZE, encode_frame};
pub use packet::{Packet, PacketBody, decode_packet, encode_packet};
pub use value::Value;
