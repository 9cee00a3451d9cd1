//! Session-scope messages: handshake, liveness, call markers and replies.
//!
//! Every message is one frame laid out as `[tag][sender HostAddress][fields]`. Tags are
//! part of the wire format and must never be renumbered.

use crate::address::HostAddress;
use crate::error::{FrameError, Result};
use crate::fault::Fault;
use crate::frame::{Frame, FrameBuilder};

/// Stable wire tags for [`SessionBody`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Session hello.
    Hello = 0,
    /// Hello / connect acknowledgement.
    HelloAck = 1,
    /// Per-object connect.
    Connect = 2,
    /// Liveness heartbeat.
    Heartbeat = 3,
    /// Per-object disconnect.
    Disconnect = 4,
    /// End of session.
    TerminateSession = 5,
    /// Remote fault reply.
    Exception = 6,
    /// Start of an event; an endpoint event frame follows.
    Event = 7,
    /// Start of a call; an endpoint request or notification frame follows.
    Request = 8,
    /// Start of a reply; an endpoint response frame follows.
    Response = 9,
    /// Reply that is a reference to a hosted object.
    EloquentObject = 10,
    /// Event subscription.
    Subscribe = 11,
    /// Event unsubscription.
    Unsubscribe = 12,
    /// Protocol error reply.
    Error = 13,
    /// Generic success reply.
    Ack = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::HelloAck),
            2 => Ok(Self::Connect),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::Disconnect),
            5 => Ok(Self::TerminateSession),
            6 => Ok(Self::Exception),
            7 => Ok(Self::Event),
            8 => Ok(Self::Request),
            9 => Ok(Self::Response),
            10 => Ok(Self::EloquentObject),
            11 => Ok(Self::Subscribe),
            12 => Ok(Self::Unsubscribe),
            13 => Ok(Self::Error),
            14 => Ok(Self::Ack),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Protocol-level failures reported back to a single requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// No object hosted under the requested id.
    ObjectNotFound = 0,
    /// The object's contract has no such event.
    EventNotFound = 1,
    /// The connection already subscribed to that event.
    EventAlreadySubscribed = 2,
    /// No operation with that name and arity.
    OperationNotFound = 3,
    /// The sender never said hello, or its session ended.
    SessionNotFound = 4,
    /// The request payload could not be decoded.
    InvalidRequest = 5,
}

impl TryFrom<u8> for ErrorKind {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0 => Ok(Self::ObjectNotFound),
            1 => Ok(Self::EventNotFound),
            2 => Ok(Self::EventAlreadySubscribed),
            3 => Ok(Self::OperationNotFound),
            4 => Ok(Self::SessionNotFound),
            5 => Ok(Self::InvalidRequest),
            other => Err(FrameError::UnknownErrorKind(other)),
        }
    }
}

/// Variant-specific part of a session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBody {
    /// Client announces itself; the sender address is where events are delivered.
    Hello,
    /// Reply to `Hello` or `Connect`.
    HelloAck {
        /// Whether the hello/connect was accepted.
        acknowledged: bool,
    },
    /// Open a logical connection to a hosted object.
    Connect {
        /// Hosted object id.
        object_id: String,
        /// Client-assigned connection id.
        connection_id: i32,
    },
    /// Client is alive.
    Heartbeat,
    /// Close a logical connection.
    Disconnect {
        /// Hosted object id.
        object_id: String,
        /// Connection being closed.
        connection_id: i32,
    },
    /// Client is going away.
    TerminateSession,
    /// A call failed inside the hosted object.
    Exception {
        /// Description of the failure.
        fault: Fault,
    },
    /// An endpoint event frame follows.
    Event,
    /// An endpoint request or notification frame follows.
    Request,
    /// An endpoint response frame follows.
    Response,
    /// The call returned a hosted object.
    EloquentObject {
        /// Id the returned object is hosted under.
        object_id: String,
    },
    /// Start delivering an event to this connection.
    Subscribe {
        /// Hosted object id.
        object_id: String,
        /// Subscribing connection.
        connection_id: i32,
        /// Event name.
        event: String,
    },
    /// Stop delivering an event to this connection.
    Unsubscribe {
        /// Hosted object id.
        object_id: String,
        /// Subscribed connection.
        connection_id: i32,
        /// Event name.
        event: String,
    },
    /// A request could not be served.
    Error {
        /// What went wrong.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// Request served, nothing to return.
    Ack,
}

impl SessionBody {
    /// Wire tag of this variant.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Hello => MessageType::Hello,
            Self::HelloAck { .. } => MessageType::HelloAck,
            Self::Connect { .. } => MessageType::Connect,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::Disconnect { .. } => MessageType::Disconnect,
            Self::TerminateSession => MessageType::TerminateSession,
            Self::Exception { .. } => MessageType::Exception,
            Self::Event => MessageType::Event,
            Self::Request => MessageType::Request,
            Self::Response => MessageType::Response,
            Self::EloquentObject { .. } => MessageType::EloquentObject,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Error { .. } => MessageType::Error,
            Self::Ack => MessageType::Ack,
        }
    }
}

/// A session message: sender identity plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    /// Address of the side that sent this message.
    pub sender: HostAddress,
    /// Variant payload.
    pub body: SessionBody,
}

impl SessionMessage {
    /// Create a message.
    #[must_use]
    pub const fn new(sender: HostAddress, body: SessionBody) -> Self {
        Self { sender, body }
    }

    /// Serialize into a single frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut builder = FrameBuilder::new();
        builder.write_byte(self.body.message_type() as u8);
        self.sender.write(&mut builder);

        match &self.body {
            SessionBody::Hello
            | SessionBody::Heartbeat
            | SessionBody::TerminateSession
            | SessionBody::Event
            | SessionBody::Request
            | SessionBody::Response
            | SessionBody::Ack => {}
            SessionBody::HelloAck { acknowledged } => {
                builder.write_bool(*acknowledged);
            }
            SessionBody::Connect {
                object_id,
                connection_id,
            }
            | SessionBody::Disconnect {
                object_id,
                connection_id,
            } => {
                builder.write_string(object_id).write_i32(*connection_id);
            }
            SessionBody::Exception { fault } => fault.write(&mut builder),
            SessionBody::EloquentObject { object_id } => {
                builder.write_string(object_id);
            }
            SessionBody::Subscribe {
                object_id,
                connection_id,
                event,
            }
            | SessionBody::Unsubscribe {
                object_id,
                connection_id,
                event,
            } => {
                builder
                    .write_string(object_id)
                    .write_i32(*connection_id)
                    .write_string(event);
            }
            SessionBody::Error { kind, message } => {
                builder.write_byte(*kind as u8).write_string(message);
            }
        }

        builder.into_frame()
    }

    /// Parse a frame, dispatching on the leading tag.
    ///
    /// # Errors
    ///
    /// Fails with [`FrameError::UnknownMessageType`] on an unknown tag, or any frame
    /// error on truncated fields.
    pub fn from_frame(mut frame: Frame) -> Result<Self> {
        let message_type = MessageType::try_from(frame.take_byte()?)?;
        let sender = HostAddress::read(&mut frame)?;

        let body = match message_type {
            MessageType::Hello => SessionBody::Hello,
            MessageType::HelloAck => SessionBody::HelloAck {
                acknowledged: frame.take_bool()?,
            },
            MessageType::Connect => SessionBody::Connect {
                object_id: frame.take_string()?,
                connection_id: frame.take_i32()?,
            },
            MessageType::Heartbeat => SessionBody::Heartbeat,
            MessageType::Disconnect => SessionBody::Disconnect {
                object_id: frame.take_string()?,
                connection_id: frame.take_i32()?,
            },
            MessageType::TerminateSession => SessionBody::TerminateSession,
            MessageType::Exception => SessionBody::Exception {
                fault: Fault::read(&mut frame)?,
            },
            MessageType::Event => SessionBody::Event,
            MessageType::Request => SessionBody::Request,
            MessageType::Response => SessionBody::Response,
            MessageType::EloquentObject => SessionBody::EloquentObject {
                object_id: frame.take_string()?,
            },
            MessageType::Subscribe => SessionBody::Subscribe {
                object_id: frame.take_string()?,
                connection_id: frame.take_i32()?,
                event: frame.take_string()?,
            },
            MessageType::Unsubscribe => SessionBody::Unsubscribe {
                object_id: frame.take_string()?,
                connection_id: frame.take_i32()?,
                event: frame.take_string()?,
            },
            MessageType::Error => SessionBody::Error {
                kind: ErrorKind::try_from(frame.take_byte()?)?,
                message: frame.take_string()?,
            },
            MessageType::Ack => SessionBody::Ack,
        };

        Ok(Self { sender, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> HostAddress {
        HostAddress::new("127.0.0.1", 4000)
    }

    fn roundtrip(body: SessionBody) {
        let message = SessionMessage::new(sender(), body);
        let decoded = SessionMessage::from_frame(message.to_frame()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_layout_starts_with_tag_and_sender() {
        let frame = SessionMessage::new(sender(), SessionBody::Heartbeat).to_frame();
        let bytes = frame.to_bytes();

        assert_eq!(bytes[0], MessageType::Heartbeat as u8);
        // ip length prefix, little-endian
        assert_eq!(&bytes[1..5], &[9, 0, 0, 0]);
        assert_eq!(&bytes[5..14], b"127.0.0.1");
        assert_eq!(&bytes[14..18], &4000_i32.to_le_bytes());
        assert_eq!(bytes.len(), 18);
    }

    #[test]
    fn test_variants_with_fields() {
        roundtrip(SessionBody::HelloAck {
            acknowledged: false,
        });
        roundtrip(SessionBody::Connect {
            object_id: "calculator".into(),
            connection_id: 3,
        });
        roundtrip(SessionBody::Exception {
            fault: Fault::new("app::Oops", "oops").with_inner(Fault::new("inner", "cause")),
        });
        roundtrip(SessionBody::Subscribe {
            object_id: "calculator".into(),
            connection_id: 1,
            event: "ResultReady".into(),
        });
        roundtrip(SessionBody::Error {
            kind: ErrorKind::EventAlreadySubscribed,
            message: "already".into(),
        });
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut builder = FrameBuilder::new();
        builder.write_byte(200);
        sender().write(&mut builder);

        assert!(matches!(
            SessionMessage::from_frame(builder.into_frame()),
            Err(FrameError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_truncated_message_fails() {
        let mut builder = FrameBuilder::new();
        builder.write_byte(MessageType::Connect as u8);
        sender().write(&mut builder);
        builder.write_string("calculator");

        assert!(matches!(
            SessionMessage::from_frame(builder.into_frame()),
            Err(FrameError::EndOfFrame { .. })
        ));
    }

    #[test]
    fn test_unknown_error_kind() {
        let mut builder = FrameBuilder::new();
        builder.write_byte(MessageType::Error as u8);
        sender().write(&mut builder);
        builder.write_byte(99).write_string("?");

        assert!(matches!(
            SessionMessage::from_frame(builder.into_frame()),
            Err(FrameError::UnknownErrorKind(99))
        ));
    }
}
