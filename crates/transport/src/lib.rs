//! Transport bindings for eloquent object RPC.
//!
//! The RPC core only ever sees byte streams. A [`Binding`] creates them:
//! - `listen` opens an input channel (a [`Listener`] that yields one stream per peer)
//! - `connect` opens an output channel (a single stream to a peer)
//!
//! Bindings are selected by URI scheme: `tcp`, `pipe` (Unix domain sockets) and
//! `memory` (in-process, for tests).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod memory;
pub mod pipe;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use eloquent_wire::{HostAddress, Scheme};
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{Result, TransportError};
pub use memory::MemoryBinding;
pub use pipe::PipeBinding;
pub use tcp::TcpBinding;

/// A bidirectional byte stream.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed channel handed to the RPC layer.
pub type BoxChannel = Box<dyn Channel>;

/// An open input channel.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next peer and return its stream.
    async fn accept(&self) -> Result<BoxChannel>;

    /// The address actually bound (port 0 resolved).
    fn local_address(&self) -> &HostAddress;

    /// Stop accepting and release the address.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for input and output channels of one transport kind.
#[async_trait]
pub trait Binding: Send + Sync + 'static {
    /// Scheme this binding serves.
    fn scheme(&self) -> Scheme;

    /// Open an input channel at `address`.
    async fn listen(&self, address: &HostAddress) -> Result<Box<dyn Listener>>;

    /// Open an output channel to `address`.
    async fn connect(&self, address: &HostAddress) -> Result<BoxChannel>;
}

/// The default binding for a scheme.
#[must_use]
pub fn binding_for(scheme: Scheme) -> Arc<dyn Binding> {
    match scheme {
        Scheme::Tcp => Arc::new(TcpBinding::new()),
        Scheme::Pipe => Arc::new(PipeBinding::new()),
        Scheme::Memory => Arc::new(MemoryBinding::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_for_matches_scheme() {
        for scheme in [Scheme::Tcp, Scheme::Pipe, Scheme::Memory] {
            assert_eq!(binding_for(scheme).scheme(), scheme);
        }
    }
}
