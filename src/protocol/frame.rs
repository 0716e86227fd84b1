//! Length-prefixed wire frames.
//!
//! Every message exchanged with a server is a single [`Frame`]:
//!
//! ```text
//! +----------------+--------+-------------------+
//! | length: u32 BE | code   | payload           |
//! | (1 + payload)  | 1 byte | length - 1 bytes  |
//! +----------------+--------+-------------------+
//! ```
//!
//! TCP has no message boundaries, so [`FrameCodec`] buffers whatever arrives
//! and only yields a frame once all `4 + length` bytes are present. Feeding it
//! one byte at a time produces the same frames as feeding it everything at once.
use thiserror::Error;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on `length` (opcode plus payload).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error("frame declared a zero length; every frame carries an opcode")]
    Empty,
}

/// One protocol message: an opcode and its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Vec<u8>,
}

/// Outcome of a single [`decode`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    NeedMoreBytes,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Frame with no payload, e.g. a ping.
    pub fn empty(code: u8) -> Self {
        Self::new(code, Vec::new())
    }

    /// Encodes the frame, rejecting it if it would exceed `max_frame_size`.
    pub fn encode(&self, max_frame_size: usize) -> Result<Vec<u8>, FrameError> {
        encode(self.code, &self.payload, max_frame_size)
    }
}

/// Produces `[length:4][code:1][payload]`.
pub fn encode(code: u8, payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FrameError> {
    let length = 1 + payload.len();
    let max = max_frame_size.min(u32::MAX as usize);
    if length > max {
        return Err(FrameError::Oversized { size: length, max });
    }

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    out.push(code);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Removes exactly one frame from the front of `buf` if it is complete.
///
/// When fewer than `4 + length` bytes are buffered the buffer is left untouched
/// and [`Decoded::NeedMoreBytes`] is returned. A declared length of zero or one
/// above `max_frame_size` can never become valid, so it is an error.
pub fn decode(buf: &mut Vec<u8>, max_frame_size: usize) -> Result<Decoded, FrameError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(Decoded::NeedMoreBytes);
    }

    let mut prefix = [0_u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let length = u32::from_be_bytes(prefix) as usize;

    if length == 0 {
        return Err(FrameError::Empty);
    }
    if length > max_frame_size {
        return Err(FrameError::Oversized {
            size: length,
            max: max_frame_size,
        });
    }
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(Decoded::NeedMoreBytes);
    }

    let code = buf[LENGTH_PREFIX_SIZE];
    let payload = buf[LENGTH_PREFIX_SIZE + 1..LENGTH_PREFIX_SIZE + length].to_vec();
    buf.drain(..LENGTH_PREFIX_SIZE + length);

    Ok(Decoded::Frame(Frame { code, payload }))
}

/// Accumulates partial reads until whole frames can be decoded.
#[derive(Debug)]
pub struct FrameCodec {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn decode(&mut self) -> Result<Decoded, FrameError> {
        decode(&mut self.buf, self.max_frame_size)
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = encode(7, b"abc", DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 4, 7, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_empty_payload() {
        let bytes = Frame::empty(1).encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let err = encode(1, &[0_u8; 16], 8).unwrap_err();
        assert_eq!(err, FrameError::Oversized { size: 17, max: 8 });
    }

    #[test]
    fn decode_needs_whole_frame() {
        let mut buf = vec![0, 0, 0, 3, 9, 1];
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Decoded::NeedMoreBytes
        );
        assert_eq!(buf, vec![0, 0, 0, 3, 9, 1]);

        buf.push(2);
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Decoded::Frame(Frame::new(9, vec![1, 2]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_leaves_following_frame() {
        let mut buf = encode(1, b"x", DEFAULT_MAX_FRAME_SIZE).unwrap();
        buf.extend(encode(2, b"yz", DEFAULT_MAX_FRAME_SIZE).unwrap());

        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Decoded::Frame(Frame::new(1, b"x".to_vec()))
        );
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Decoded::Frame(Frame::new(2, b"yz".to_vec()))
        );
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Decoded::NeedMoreBytes
        );
    }

    #[test]
    fn decode_rejects_zero_length() {
        let mut buf = vec![0, 0, 0, 0, 1];
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err(),
            FrameError::Empty
        );
    }

    #[test]
    fn decode_rejects_length_over_limit() {
        let mut buf = vec![0, 0, 1, 0];
        assert_eq!(
            decode(&mut buf, 16).unwrap_err(),
            FrameError::Oversized { size: 256, max: 16 }
        );
    }

    #[test]
    fn codec_split_at_every_boundary() {
        let frame = Frame::new(42, (0..=255).collect::<Vec<u8>>());
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        for split in 0..=bytes.len() {
            let mut codec = FrameCodec::default();
            codec.feed(&bytes[..split]);
            if split < bytes.len() {
                assert_eq!(codec.decode().unwrap(), Decoded::NeedMoreBytes);
            }
            codec.feed(&bytes[split..]);
            assert_eq!(codec.decode().unwrap(), Decoded::Frame(frame.clone()));
            assert_eq!(codec.buffered(), 0);
        }
    }

    #[test]
    fn codec_byte_at_a_time() {
        let frames = vec![
            Frame::new(1, b"first".to_vec()),
            Frame::empty(2),
            Frame::new(3, vec![0; 300]),
        ];
        let mut bytes = Vec::new();
        for f in &frames {
            bytes.extend(f.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        }

        let mut codec = FrameCodec::default();
        let mut out = Vec::new();
        for b in bytes {
            codec.feed(&[b]);
            while let Decoded::Frame(f) = codec.decode().unwrap() {
                out.push(f);
            }
        }
        assert_eq!(out, frames);
    }
}
