//! Growable binary buffer with a write position and a read cursor.
//!
//! Encoding appends to the end of the written region; decoding only moves the
//! read cursor forward. Already-written bytes are never mutated in place.

use super::error::{ProtocolError, ProtocolResult};

/// Initial capacity used by [`ByteBuffer::new`].
const DEFAULT_CAPACITY: usize = 1024;

/// Position-tracked buffer for the little-endian wire primitives.
///
/// Invariant: `read_cursor <= len <= storage.len()`.
///
/// Storage is managed explicitly rather than through `Vec` growth so that the
/// reallocation policy is fixed: when a write does not fit, the storage grows
/// to `2 * (len + required)` and the written prefix is copied over.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    len: usize,
    read_cursor: usize,
}

impl ByteBuffer {
    /// Create an empty buffer for encoding.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer with a specific initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            len: 0,
            read_cursor: 0,
        }
    }

    /// Wrap received bytes for decoding. The whole input counts as written.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            storage: bytes,
            len,
            read_cursor: 0,
        }
    }

    /// Number of bytes logically written.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Offset of the read cursor.
    pub fn position(&self) -> usize {
        self.read_cursor
    }

    /// Bytes written but not yet read.
    pub fn remaining(&self) -> usize {
        self.len - self.read_cursor
    }

    /// The written region.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Consume the buffer, returning exactly the written bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.storage.truncate(self.len);
        self.storage
    }

    /// Append one byte.
    pub fn write8(&mut self, value: u8) {
        let offset = self.reserve(1);
        self.storage[offset] = value;
    }

    /// Append a little-endian u32.
    pub fn write32(&mut self, value: u32) {
        let offset = self.reserve(4);
        self.storage[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Append a u32 length prefix followed by the raw bytes.
    ///
    /// Fails without writing anything if the length does not fit in 32 bits.
    pub fn write(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        let length = u32::try_from(bytes.len()).map_err(|_| ProtocolError::TooLarge(bytes.len()))?;
        let offset = self.reserve(4 + bytes.len());
        self.storage[offset..offset + 4].copy_from_slice(&length.to_le_bytes());
        self.storage[offset + 4..offset + 4 + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read one byte at the cursor.
    pub fn read8(&mut self) -> ProtocolResult<u8> {
        let offset = self.advance(1)?;
        Ok(self.storage[offset])
    }

    /// Read a little-endian u32 at the cursor.
    pub fn read32(&mut self) -> ProtocolResult<u32> {
        let offset = self.advance(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.storage[offset..offset + 4]);
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a u32 length prefix and return that many bytes.
    ///
    /// If the prefix claims more bytes than remain, the cursor is left just
    /// past the prefix and an underrun is reported.
    pub fn read(&mut self) -> ProtocolResult<&[u8]> {
        let length = self.read32()? as usize;
        let offset = self.advance(length)?;
        Ok(&self.storage[offset..offset + length])
    }

    /// Grow if needed and claim `delta` bytes at the end of the written region.
    fn reserve(&mut self, delta: usize) -> usize {
        let required = self.len + delta;
        if required > self.storage.len() {
            let mut grown = vec![0; required * 2];
            grown[..self.len].copy_from_slice(&self.storage[..self.len]);
            self.storage = grown;
        }
        let offset = self.len;
        self.len = required;
        offset
    }

    /// Bounds-check a read of `delta` bytes and move the cursor past it.
    fn advance(&mut self, delta: usize) -> ProtocolResult<usize> {
        let available = self.remaining();
        if delta > available {
            return Err(ProtocolError::BufferUnderrun {
                offset: self.read_cursor,
                needed: delta,
                available,
            });
        }
        let offset = self.read_cursor;
        self.read_cursor += delta;
        Ok(offset)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_read_back_in_write_order() {
        let mut bb = ByteBuffer::new();
        bb.write8(0);
        bb.write8(255);
        bb.write32(0);
        bb.write32(0xDEAD_BEEF);
        bb.write(b"hello").unwrap();
        bb.write(b"").unwrap();
        bb.write32(u32::MAX);

        let mut reader = ByteBuffer::from_bytes(bb.into_vec());
        assert_eq!(reader.read8().unwrap(), 0);
        assert_eq!(reader.read8().unwrap(), 255);
        assert_eq!(reader.read32().unwrap(), 0);
        assert_eq!(reader.read32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read().unwrap(), b"hello");
        assert_eq!(reader.read().unwrap(), b"");
        assert_eq!(reader.read32().unwrap(), u32::MAX);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn write32_is_little_endian() {
        let mut bb = ByteBuffer::new();
        bb.write32(0x0403_0201);
        assert_eq!(bb.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn write_prefixes_length_little_endian() {
        let mut bb = ByteBuffer::new();
        bb.write(b"abc").unwrap();
        assert_eq!(bb.as_slice(), &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn growth_from_tiny_capacity_preserves_every_byte() {
        let mut bb = ByteBuffer::with_capacity(4);
        let expected: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        for byte in &expected {
            bb.write8(*byte);
        }
        assert_eq!(bb.len(), expected.len());

        let mut reader = ByteBuffer::from_bytes(bb.into_vec());
        let actual: Vec<u8> = (0..expected.len()).map(|_| reader.read8().unwrap()).collect();
        assert_eq!(actual, expected);
        assert!(reader.read8().is_err(), "reading past the end must fail");
    }

    #[test]
    fn growth_doubles_required_size() {
        let mut bb = ByteBuffer::with_capacity(4);
        bb.write32(1);
        assert_eq!(bb.capacity(), 4, "exact fit should not grow");

        bb.write8(2);
        assert_eq!(bb.capacity(), 10, "storage grows to 2 * (len + required)");
        assert_eq!(bb.as_slice(), &[1, 0, 0, 0, 2]);
    }

    #[test]
    fn read8_on_empty_buffer_is_underrun() {
        let mut bb = ByteBuffer::from_bytes(Vec::new());
        assert_eq!(
            bb.read8(),
            Err(ProtocolError::BufferUnderrun {
                offset: 0,
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn read32_with_three_bytes_is_underrun() {
        let mut bb = ByteBuffer::from_bytes(vec![1, 2, 3]);
        assert!(matches!(
            bb.read32(),
            Err(ProtocolError::BufferUnderrun { needed: 4, available: 3, .. })
        ));
    }

    #[test]
    fn read_checks_prefix_and_body_separately() {
        // Prefix itself truncated
        let mut truncated_prefix = ByteBuffer::from_bytes(vec![5, 0]);
        assert!(truncated_prefix.read().is_err());

        // Prefix claims 5 bytes, only 2 follow
        let mut truncated_body = ByteBuffer::from_bytes(vec![5, 0, 0, 0, b'h', b'i']);
        assert!(matches!(
            truncated_body.read(),
            Err(ProtocolError::BufferUnderrun { offset: 4, needed: 5, available: 2 })
        ));
    }

    #[test]
    fn reads_never_see_unwritten_capacity() {
        // Capacity is larger than the written length; the zero-filled tail
        // must not be readable.
        let mut bb = ByteBuffer::with_capacity(64);
        bb.write8(7);
        assert_eq!(bb.capacity(), 64);
        assert_eq!(bb.read8().unwrap(), 7);
        assert!(bb.read8().is_err());
    }
}
