//! Object-call-scope messages carrying serialized call payloads.
//!
//! An endpoint message never travels alone: it is always the second frame after a
//! [`SessionBody::Request`](crate::session::SessionBody::Request),
//! [`SessionBody::Response`](crate::session::SessionBody::Response) or
//! [`SessionBody::Event`](crate::session::SessionBody::Event) marker.

use bytes::Bytes;

use crate::error::{FrameError, Result};
use crate::frame::{Frame, FrameBuilder};

/// Stable wire tags for endpoint messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointKind {
    /// Two-way call.
    Request = 0,
    /// Call result.
    Response = 1,
    /// Server-pushed event.
    Event = 2,
    /// One-way call; no reply is sent.
    Notification = 3,
}

impl TryFrom<u8> for EndpointKind {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Event),
            3 => Ok(Self::Notification),
            other => Err(FrameError::UnknownEndpointMessageType(other)),
        }
    }
}

/// Payload envelope addressed to one logical connection of one hosted object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMessage {
    /// Message variant.
    pub kind: EndpointKind,
    /// Hosted object id.
    pub object_id: String,
    /// Logical connection id.
    pub connection_id: i32,
    /// Opaque serializer output.
    pub payload: Bytes,
}

impl EndpointMessage {
    /// Create an endpoint message.
    pub fn new(
        kind: EndpointKind,
        object_id: impl Into<String>,
        connection_id: i32,
        payload: Bytes,
    ) -> Self {
        Self {
            kind,
            object_id: object_id.into(),
            connection_id,
            payload,
        }
    }

    /// Serialize into a single frame: `[tag][object_id][connection_id][payload]`.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut builder = FrameBuilder::new();
        builder
            .write_byte(self.kind as u8)
            .write_string(&self.object_id)
            .write_i32(self.connection_id)
            .write_buffer(&self.payload);
        builder.into_frame()
    }

    /// Parse a frame.
    ///
    /// # Errors
    ///
    /// Fails on an unknown tag or truncated fields.
    pub fn from_frame(mut frame: Frame) -> Result<Self> {
        let kind = EndpointKind::try_from(frame.take_byte()?)?;
        Ok(Self {
            kind,
            object_id: frame.take_string()?,
            connection_id: frame.take_i32()?,
            payload: frame.take_buffer()?,
        })
    }
}
