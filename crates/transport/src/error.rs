//! Error types for transport bindings.

use std::io;

use eloquent_wire::{HostAddress, Scheme};
use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish an output channel.
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        address: HostAddress,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Failed to open an input channel.
    #[error("Failed to listen on {address}: {source}")]
    ListenFailed {
        /// The address we tried to bind.
        address: HostAddress,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Nobody is listening at the address (in-process bindings).
    #[error("No listener at {0}")]
    NoListener(HostAddress),

    /// Something already listens at the address (in-process bindings).
    #[error("Address {0} already has a listener")]
    AddressInUse(HostAddress),

    /// The listener or channel was closed.
    #[error("Channel closed")]
    Closed,

    /// The binding is not available on this platform.
    #[error("Scheme {0} is not supported on this platform")]
    Unsupported(Scheme),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
