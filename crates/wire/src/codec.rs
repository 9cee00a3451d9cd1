//! Stream framing: every frame on the wire is `[i32 length][length bytes]`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::frame::Frame;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for encoding/decoding length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Configured maximum frame size.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek the length without consuming
        let mut header = &buf[..LENGTH_PREFIX_SIZE];
        let len = header.get_i32_le();
        let len = usize::try_from(len).map_err(|_| FrameError::NegativeLength(len))?;

        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let frame_len = LENGTH_PREFIX_SIZE + len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(Frame::new(buf.split_to(len).freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.len();
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        buf.reserve(LENGTH_PREFIX_SIZE + len);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        buf.put_i32_le(len as i32);
        buf.put(frame.to_bytes());

        Ok(())
    }
}
