//! Length-prefixed primitive reader/writer that every message is built on.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Append-only byte accumulator used to build a [`Frame`].
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single byte.
    pub fn write_byte(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a boolean as one byte (0 or 1).
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Append a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Append a UTF-8 string with an `i32` byte-length prefix.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_buffer(value.as_bytes())
    }

    /// Append a byte buffer with an `i32` length prefix.
    pub fn write_buffer(&mut self, value: &[u8]) -> &mut Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.buf.put_i32_le(value.len() as i32);
        self.buf.put_slice(value);
        self
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seal the accumulated bytes into a readable frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        Frame::new(self.buf.freeze())
    }
}

/// An immutable byte buffer with a read cursor.
///
/// `take_*` calls mirror the `write_*` calls of [`FrameBuilder`] and must be made in the
/// same order. Reading past the end fails with [`FrameError::EndOfFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    cursor: Bytes,
}

impl Frame {
    /// Wrap raw frame bytes (without the stream length prefix).
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            cursor: data.clone(),
            data,
        }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        !self.cursor.has_remaining()
    }

    /// The whole frame, independent of the cursor position.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Total frame length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(FrameError::EndOfFrame { needed, remaining });
        }
        Ok(())
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::EndOfFrame`] if the frame is exhausted.
    pub fn take_byte(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.cursor.get_u8())
    }

    /// Read a boolean.
    ///
    /// # Errors
    ///
    /// Fails at end of frame or if the byte is neither 0 nor 1.
    pub fn take_bool(&mut self) -> Result<bool> {
        match self.take_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameError::InvalidBool(other)),
        }
    }

    /// Read a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::EndOfFrame`] if fewer than four bytes remain.
    pub fn take_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.cursor.get_i32_le())
    }

    /// Read a length-prefixed byte buffer.
    ///
    /// # Errors
    ///
    /// Fails on a negative length or if the buffer runs past the end of the frame.
    pub fn take_buffer(&mut self) -> Result<Bytes> {
        let len = self.take_i32()?;
        let len = usize::try_from(len).map_err(|_| FrameError::NegativeLength(len))?;
        self.ensure(len)?;
        Ok(self.cursor.split_to(len))
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails like [`Frame::take_buffer`], or if the bytes are not valid UTF-8.
    pub fn take_string(&mut self) -> Result<String> {
        let bytes = self.take_buffer()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_take_in_order() {
        let mut builder = FrameBuilder::new();
        builder
            .write_byte(7)
            .write_bool(true)
            .write_i32(-42)
            .write_string("héllo")
            .write_buffer(&[1, 2, 3]);
        let mut frame = builder.into_frame();

        assert_eq!(frame.take_byte().unwrap(), 7);
        assert!(frame.take_bool().unwrap());
        assert_eq!(frame.take_i32().unwrap(), -42);
        assert_eq!(frame.take_string().unwrap(), "héllo");
        assert_eq!(frame.take_buffer().unwrap().as_ref(), &[1, 2, 3]);
        assert!(frame.is_exhausted());
    }

    #[test]
    fn test_int32_is_little_endian() {
        let mut builder = FrameBuilder::new();
        builder.write_i32(0x0102_0304);
        assert_eq!(builder.into_frame().to_bytes().as_ref(), &[4, 3, 2, 1]);
    }

    #[test]
    fn test_take_past_end_fails() {
        let mut builder = FrameBuilder::new();
        builder.write_byte(1);
        let mut frame = builder.into_frame();

        frame.take_byte().unwrap();
        assert!(matches!(
            frame.take_byte(),
            Err(FrameError::EndOfFrame {
                needed: 1,
                remaining: 0
            })
        ));
    }

    #[test]
    fn test_truncated_string_fails() {
        let mut builder = FrameBuilder::new();
        builder.write_i32(10).write_byte(b'a');
        let mut frame = builder.into_frame();

        assert!(matches!(
            frame.take_string(),
            Err(FrameError::EndOfFrame {
                needed: 10,
                remaining: 1
            })
        ));
    }

    #[test]
    fn test_negative_length_fails() {
        let mut builder = FrameBuilder::new();
        builder.write_i32(-1);
        let mut frame = builder.into_frame();

        assert!(matches!(
            frame.take_buffer(),
            Err(FrameError::NegativeLength(-1))
        ));
    }

    #[test]
    fn test_invalid_bool() {
        let mut builder = FrameBuilder::new();
        builder.write_byte(2);
        assert!(matches!(
            builder.into_frame().take_bool(),
            Err(FrameError::InvalidBool(2))
        ));
    }

    #[test]
    fn test_to_bytes_ignores_cursor() {
        let mut builder = FrameBuilder::new();
        builder.write_i32(5).write_byte(9);
        let mut frame = builder.into_frame();
        frame.take_i32().unwrap();

        assert_eq!(frame.remaining(), 1);
        assert_eq!(frame.to_bytes().len(), 5);
    }
}
