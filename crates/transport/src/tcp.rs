//! TCP binding.

use async_trait::async_trait;
use eloquent_wire::{HostAddress, Scheme};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::{Binding, BoxChannel, Listener};

/// TCP socket binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBinding;

impl TcpBinding {
    /// Create a TCP binding.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Binding for TcpBinding {
    fn scheme(&self) -> Scheme {
        Scheme::Tcp
    }

    async fn listen(&self, address: &HostAddress) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind((address.ip(), address.port()))
            .await
            .map_err(|source| TransportError::ListenFailed {
                address: address.clone(),
                source,
            })?;

        let local = listener.local_addr()?;
        let local_address = address.with_port(local.port());
        info!("TCP listener bound on {}", local_address);

        Ok(Box::new(TcpInputChannel {
            listener,
            local_address,
        }))
    }

    async fn connect(&self, address: &HostAddress) -> Result<BoxChannel> {
        let stream = TcpStream::connect((address.ip(), address.port()))
            .await
            .map_err(|source| TransportError::ConnectFailed {
                address: address.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!("TCP channel connected to {}", address);
        Ok(Box::new(stream))
    }
}

struct TcpInputChannel {
    listener: TcpListener,
    local_address: HostAddress,
}

#[async_trait]
impl Listener for TcpInputChannel {
    async fn accept(&self) -> Result<BoxChannel> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("Accepted TCP connection from {}", peer);
        Ok(Box::new(stream))
    }

    fn local_address(&self) -> &HostAddress {
        &self.local_address
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing TCP listener on {}", self.local_address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listen_resolves_port_zero() {
        let binding = TcpBinding::new();
        let listener = binding
            .listen(&HostAddress::new("127.0.0.1", 0))
            .await
            .unwrap();

        assert_ne!(listener.local_address().port(), 0);
        assert_eq!(listener.local_address().ip(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let binding = TcpBinding::new();
        let listener = binding
            .listen(&HostAddress::new("127.0.0.1", 0))
            .await
            .unwrap();
        let address = listener.local_address().clone();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = binding.connect(&address).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let binding = TcpBinding::new();
        // Bind then drop to get a port nobody listens on
        let address = {
            let listener = binding
                .listen(&HostAddress::new("127.0.0.1", 0))
                .await
                .unwrap();
            listener.local_address().clone()
        };

        assert!(matches!(
            binding.connect(&address).await,
            Err(TransportError::ConnectFailed { .. })
        ));
    }
}
