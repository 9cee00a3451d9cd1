//! Wire protocol for eloquent object RPC.
//!
//! This crate defines everything that crosses the network:
//! - [`Frame`] / [`FrameBuilder`]: the primitive reader/writer all messages use
//! - [`FrameCodec`]: `[i32 length][bytes]` stream framing for `tokio_util`
//! - [`SessionMessage`]: handshake, liveness and call markers, each tagged with the sender
//! - [`EndpointMessage`]: request/response/event envelopes carrying serialized payloads
//! - [`HostAddress`] / [`Endpoint`]: `ip:port` identities and `scheme://ip:port` URIs
//!
//! A logical call is two frames written back to back in one flush: a session
//! [`SessionBody::Request`] marker followed by an endpoint request.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod frame;
pub mod session;

pub use address::{Endpoint, HostAddress, Scheme};
pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use endpoint::{EndpointKind, EndpointMessage};
pub use error::{AddressError, FrameError, Result};
pub use fault::Fault;
pub use frame::{Frame, FrameBuilder};
pub use session::{ErrorKind, MessageType, SessionBody, SessionMessage};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
