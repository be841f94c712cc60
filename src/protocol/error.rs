//! Codec-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding buffers, values, packets and frames.
///
/// All of these indicate either a caller bug (oversized input) or a corrupted
/// stream. None of them are recoverable for the stream they occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A read would move past the written length of the buffer
    #[error("buffer underrun: needed {needed} bytes at offset {offset}, {available} available")]
    BufferUnderrun {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A byte string or collection is too long for a 32-bit length prefix
    #[error("length {0} does not fit in 32 bits")]
    TooLarge(usize),

    /// A frame length prefix exceeds the configured maximum
    #[error("frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// Unknown value tag byte
    #[error("invalid value tag {0}")]
    InvalidTag(u8),

    /// Unknown packet kind or response status byte
    #[error("invalid packet kind {0}")]
    InvalidKind(u8),

    /// Nested arrays/objects exceed the decoder's depth limit
    #[error("value nesting exceeds depth {0}")]
    TooDeep(usize),

    /// Bytes left over after a complete packet was decoded
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A value could not be converted to or from its serde representation
    #[error("cannot convert value: {0}")]
    Conversion(String),
}

/// Result type for codec operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Conversion(err.to_string())
    }
}
