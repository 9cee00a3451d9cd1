//! Named-pipe binding, backed by Unix domain sockets.
//!
//! A host address `ip:port` maps to a socket file in the temp directory, so pipe
//! endpoints keep the same identity scheme as TCP ones.

use std::path::PathBuf;
#[cfg(unix)]
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use eloquent_wire::{HostAddress, Scheme};
#[cfg(unix)]
use tracing::{debug, info};

use crate::error::Result;
#[cfg(unix)]
use crate::error::TransportError;
use crate::{Binding, BoxChannel, Listener};

/// First port handed out when a pipe listener asks for port 0.
#[cfg(unix)]
const EPHEMERAL_PORT_START: u16 = 49152;

#[cfg(unix)]
static NEXT_EPHEMERAL_PORT: AtomicU16 = AtomicU16::new(EPHEMERAL_PORT_START);

/// Named-pipe binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeBinding;

impl PipeBinding {
    /// Create a pipe binding.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Socket file used for `address`.
    #[must_use]
    pub fn socket_path(address: &HostAddress) -> PathBuf {
        let ip: String = address
            .ip()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!("eloquent-{ip}-{}.sock", address.port()))
    }
}

#[cfg(unix)]
#[async_trait]
impl Binding for PipeBinding {
    fn scheme(&self) -> Scheme {
        Scheme::Pipe
    }

    async fn listen(&self, address: &HostAddress) -> Result<Box<dyn Listener>> {
        let local_address = if address.port() == 0 {
            let pid_offset = u16::try_from(std::process::id() % 4096).unwrap_or_default();
            let port = NEXT_EPHEMERAL_PORT
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(pid_offset)
                .max(1);
            address.with_port(port)
        } else {
            address.clone()
        };

        let path = Self::socket_path(&local_address);
        remove_stale_socket(&path).await;

        let listener = tokio::net::UnixListener::bind(&path).map_err(|source| {
            TransportError::ListenFailed {
                address: local_address.clone(),
                source,
            }
        })?;
        info!("Pipe listener bound on {} ({})", local_address, path.display());

        Ok(Box::new(PipeInputChannel {
            listener,
            local_address,
            path,
        }))
    }

    async fn connect(&self, address: &HostAddress) -> Result<BoxChannel> {
        let path = Self::socket_path(address);
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .map_err(|source| TransportError::ConnectFailed {
                address: address.clone(),
                source,
            })?;
        debug!("Pipe channel connected to {}", address);
        Ok(Box::new(stream))
    }
}

#[cfg(not(unix))]
#[async_trait]
impl Binding for PipeBinding {
    fn scheme(&self) -> Scheme {
        Scheme::Pipe
    }

    async fn listen(&self, _address: &HostAddress) -> Result<Box<dyn Listener>> {
        Err(crate::error::TransportError::Unsupported(Scheme::Pipe))
    }

    async fn connect(&self, _address: &HostAddress) -> Result<BoxChannel> {
        Err(crate::error::TransportError::Unsupported(Scheme::Pipe))
    }
}

/// Remove a socket file left behind by a dead listener.
#[cfg(unix)]
async fn remove_stale_socket(path: &std::path::Path) {
    if tokio::fs::metadata(path).await.is_ok()
        && tokio::net::UnixStream::connect(path).await.is_err()
    {
        debug!("Removing stale socket {}", path.display());
        let _ = tokio::fs::remove_file(path).await;
    }
}

#[cfg(unix)]
struct PipeInputChannel {
    listener: tokio::net::UnixListener,
    local_address: HostAddress,
    path: PathBuf,
}

#[cfg(unix)]
#[async_trait]
impl Listener for PipeInputChannel {
    async fn accept(&self) -> Result<BoxChannel> {
        let (stream, _) = self.listener.accept().await?;
        debug!("Accepted pipe connection on {}", self.local_address);
        Ok(Box::new(stream))
    }

    fn local_address(&self) -> &HostAddress {
        &self.local_address
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing pipe listener on {}", self.local_address);
        drop(self.listener);
        let _ = tokio::fs::remove_file(&self.path).await;
        Ok(())
    }
}
