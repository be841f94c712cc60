//! Length-prefixed framing over a byte stream.
//!
//! Each frame is `[u32 little-endian length][payload]`. A pipe read may carry
//! zero, one or several frames and may end in the middle of one, so the
//! decoder accumulates bytes across pushes and yields payloads as soon as they
//! are complete.
//!
//! # Example
//!
//! ```
//! use tsunagi::protocol::{FrameDecoder, encode_frame, DEFAULT_MAX_FRAME_SIZE};
//!
//! let frame = encode_frame(b"hello", DEFAULT_MAX_FRAME_SIZE).unwrap();
//! let mut decoder = FrameDecoder::new();
//!
//! assert_eq!(decoder.push(&frame[..3]).count(), 0);
//! let payloads: Vec<_> = decoder.push(&frame[3..]).collect::<Result<_, _>>().unwrap();
//! assert_eq!(payloads, vec![b"hello".to_vec()]);
//! ```

use super::byte_buffer::ByteBuffer;
use super::error::{ProtocolError, ProtocolResult};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single payload (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Initial accumulation buffer size; matches a typical pipe read.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Wrap a payload with its length prefix.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> ProtocolResult<Vec<u8>> {
    if payload.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            length: payload.len(),
            max: max_frame_size,
        });
    }
    let mut bb = ByteBuffer::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    bb.write(payload)?;
    Ok(bb.into_vec())
}

/// Reassembles payloads from arbitrarily chunked input.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Accumulated bytes; `buffer[..consumed]` has already been yielded.
    buffer: Vec<u8>,
    consumed: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_CAPACITY),
            consumed: 0,
            max_frame_size,
        }
    }

    /// Append a chunk and iterate over the frames it completes.
    ///
    /// Frames are extracted lazily: each payload is handed out before the
    /// next one is parsed. Frames left unread when the iterator is dropped
    /// stay buffered and are returned by the next push.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.compact();
        self.buffer.extend_from_slice(chunk);
        Frames {
            decoder: self,
            failed: false,
        }
    }

    /// Extract the next complete payload, if any.
    ///
    /// A length prefix larger than the maximum frame size is an error; the
    /// stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let pending = &self.buffer[self.consumed..];
        if pending.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&pending[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_le_bytes(prefix) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        if pending.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        let payload = pending[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length].to_vec();
        self.consumed += LENGTH_PREFIX_SIZE + length;
        Ok(Some(payload))
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.buffered_len() == 0
    }

    /// Drop already-yielded bytes from the front of the buffer.
    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameDecoder::push`].
///
/// Yields at most one error, after which it is exhausted.
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = ProtocolResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload, DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    fn collect(decoder: &mut FrameDecoder, chunk: &[u8]) -> Vec<Vec<u8>> {
        decoder
            .push(chunk)
            .collect::<ProtocolResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn encode_prepends_little_endian_length() {
        assert_eq!(frame(b"hi"), vec![2, 0, 0, 0, b'h', b'i']);
        assert_eq!(frame(b""), vec![0, 0, 0, 0]);
    }

    #[test]
    fn single_complete_frame() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(collect(&mut decoder, &frame(b"hello")), vec![b"hello".to_vec()]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn split_at_every_position_yields_one_identical_payload() {
        let payload: Vec<u8> = (0..=40).collect();
        let bytes = frame(&payload);

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = collect(&mut decoder, &bytes[..split]);
            frames.extend(collect(&mut decoder, &bytes[split..]));
            assert_eq!(frames, vec![payload.clone()], "split at {split}");
            assert!(decoder.is_empty());
        }
    }

    #[rstest]
    #[case::two_chunks(&[7])]
    #[case::three_chunks(&[2, 17])]
    #[case::prefix_split(&[1, 3, 4])]
    #[case::many_chunks(&[1, 2, 3, 5, 8, 13, 21, 34])]
    fn fragmented_frame_yields_one_identical_payload(#[case] cuts: &[usize]) {
        let payload = b"this payload arrives in several pieces".to_vec();
        let bytes = frame(&payload);
        let mut decoder = FrameDecoder::new();

        let mut frames = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            frames.extend(collect(&mut decoder, &bytes[start..cut]));
            start = cut;
        }
        assert_eq!(frames, vec![payload]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn several_frames_in_one_chunk_keep_order() {
        let mut bytes = frame(b"first");
        bytes.extend(frame(b""));
        bytes.extend(frame(b"third"));

        let mut decoder = FrameDecoder::new();
        assert_eq!(
            collect(&mut decoder, &bytes),
            vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]
        );
    }

    #[test]
    fn trailing_partial_frame_stays_buffered() {
        let second = frame(b"second");
        let mut bytes = frame(b"first");
        bytes.extend_from_slice(&second[..5]);

        let mut decoder = FrameDecoder::new();
        assert_eq!(collect(&mut decoder, &bytes), vec![b"first".to_vec()]);
        assert_eq!(decoder.buffered_len(), 5);

        assert_eq!(collect(&mut decoder, &second[5..]), vec![b"second".to_vec()]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn frames_are_handed_out_one_at_a_time() {
        let mut bytes = frame(b"a");
        bytes.extend(frame(b"b"));
        let mut decoder = FrameDecoder::new();

        let mut frames = decoder.push(&bytes);
        assert_eq!(frames.next().unwrap().unwrap(), b"a".to_vec());
        drop(frames);
        // The unread frame is still there on the next push.
        assert_eq!(collect(&mut decoder, &[]), vec![b"b".to_vec()]);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let results: Vec<_> = decoder.push(&[9, 0, 0, 0]).collect();
        assert_eq!(
            results,
            vec![Err(ProtocolError::FrameTooLarge { length: 9, max: 8 })]
        );
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        assert!(matches!(
            encode_frame(&[0; 9], 8),
            Err(ProtocolError::FrameTooLarge { length: 9, max: 8 })
        ));
    }
}
