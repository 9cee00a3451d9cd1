//! Error types for the wire layer.

use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Result type alias for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Framing errors. Any of these is fatal to the stream it came from.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Tried to read more bytes than the frame holds.
    #[error("End of frame: needed {needed} bytes, {remaining} remaining")]
    EndOfFrame {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },

    /// A length prefix was negative.
    #[error("Negative length prefix: {0}")]
    NegativeLength(i32),

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// A boolean field held something other than 0 or 1.
    #[error("Invalid boolean byte: {0:#x}")]
    InvalidBool(u8),

    /// A port field was out of range.
    #[error("Invalid port on the wire: {0}")]
    InvalidPort(i32),

    /// Unknown session message tag.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Unknown endpoint message tag.
    #[error("Unknown endpoint message type: {0}")]
    UnknownEndpointMessageType(u8),

    /// Unknown protocol error kind.
    #[error("Unknown error kind: {0}")]
    UnknownErrorKind(u8),

    /// Fault chain nested deeper than allowed.
    #[error("Fault chain exceeds {0} levels")]
    FaultTooDeep(usize),

    /// Frame larger than the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors parsing host addresses and endpoint URIs.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The URI could not be parsed at all.
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// No host component.
    #[error("Missing host in {0:?}")]
    MissingHost(String),

    /// No `:port` suffix.
    #[error("Missing port in {0:?}")]
    MissingPort(String),

    /// Port is not a number in `0..=65535`.
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),

    /// Scheme is not one of the known transport bindings.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}
