//! Error types for eloquent RPC.

use std::io;
use std::time::Duration;

use eloquent_transport::TransportError;
use eloquent_wire::{AddressError, ErrorKind, Fault, FrameError, MessageType, Scheme};
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or oversized frame on a channel.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Endpoint URI could not be parsed.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Listening or connecting failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload (de)serialization failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Contract description is invalid or has no such member.
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    /// The hosted object failed while serving the call.
    #[error("Remote fault: {0}")]
    Remote(Fault),

    /// The server could not route or serve the request.
    #[error("Protocol error ({kind:?}): {message}")]
    Protocol {
        /// What went wrong.
        kind: ErrorKind,
        /// Detail sent by the server.
        message: String,
    },

    /// The peer replied with something the exchange does not allow.
    #[error("Unexpected message: expected {expected}, got {actual:?}")]
    UnexpectedMessage {
        /// What the exchange waited for.
        expected: &'static str,
        /// What arrived instead.
        actual: MessageType,
    },

    /// The server refused a connect because nothing is hosted under the id.
    #[error("Object {0:?} is not hosted")]
    ObjectNotHosted(String),

    /// An object is already hosted under the id.
    #[error("Object {0:?} is already hosted")]
    ObjectAlreadyHosted(String),

    /// Client and server URIs use different transports.
    #[error("Scheme mismatch: client uses {client}, server uses {server}")]
    SchemeMismatch {
        /// Client scheme.
        client: Scheme,
        /// Server scheme.
        server: Scheme,
    },

    /// An object-returning operation sent back a copy instead of a hosted reference.
    #[error("Operation {0:?} returned a copy, not a hosted object")]
    NotHostedResult(String),

    /// The member cannot be invoked through a proxy.
    #[error("Member {0:?} is not supported")]
    NotSupported(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The component was disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// The channel to the peer is unusable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// A parameter list had the wrong length for its target.
    #[error("Expected {expected} parameters, got {actual}")]
    ArityMismatch {
        /// Parameters the target takes.
        expected: usize,
        /// Parameters received.
        actual: usize,
    },
}

/// Contract description errors.
#[derive(Debug, Error)]
pub enum ContractError {
    /// Two operations share a name and arity.
    #[error("Ambiguous operation {name}/{arity}")]
    AmbiguousOperation {
        /// Operation name.
        name: String,
        /// Parameter count.
        arity: usize,
    },

    /// Two properties or two events share a name.
    #[error("Duplicate member {0:?}")]
    DuplicateMember(String),

    /// No operation with that name and arity.
    #[error("Operation {name}/{arity} not found")]
    OperationNotFound {
        /// Operation name.
        name: String,
        /// Parameter count.
        arity: usize,
    },

    /// No event with that name.
    #[error("Event {0:?} not found")]
    EventNotFound(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
