use std::io::{self, Read, Write};

use log::trace;
use thiserror::Error;

use super::{Decoded, Frame, FrameCodec, FrameError};

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("peer closed the stream with {buffered} bytes of an unfinished frame")]
    Closed { buffered: usize },
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Frames over any blocking byte stream.
///
/// Writes are retried until the whole frame is out, since a single `write`
/// may accept only part of it. Reads go through a [`FrameCodec`], so frames
/// split across any number of reads are reassembled.
pub struct FrameTransport<T: Read + Write> {
    stream: T,
    codec: FrameCodec,
    max_frame_size: usize,
}

impl<T: Read + Write> FrameTransport<T> {
    pub fn new(stream: T, max_frame_size: usize) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(max_frame_size),
            max_frame_size,
        }
    }

    pub fn stream(&self) -> &T {
        &self.stream
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode(self.max_frame_size)?;
        self.write_raw(&bytes)
    }

    /// Writes `bytes` in full, resuming after short writes.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    trace!("wrote {n} bytes ({written}/{})", bytes.len());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Returns a frame already sitting in the buffer, without reading.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.codec.decode()? {
            Decoded::Frame(frame) => {
                trace!(
                    "decoded frame code={} len={}",
                    frame.code,
                    frame.payload.len()
                );
                Ok(Some(frame))
            }
            Decoded::NeedMoreBytes => Ok(None),
        }
    }

    /// Performs one read into the codec buffer. A clean end of stream is
    /// reported as [`TransportError::Closed`].
    pub fn fill(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(TransportError::Closed {
                        buffered: self.codec.buffered(),
                    });
                }
                Ok(n) => {
                    trace!("read {n} bytes");
                    self.codec.feed(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocks until one whole frame has been received.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Bytes received past the last decoded frame.
    pub fn buffered(&self) -> usize {
        self.codec.buffered()
    }
}
