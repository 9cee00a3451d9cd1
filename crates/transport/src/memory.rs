//! In-memory binding for testing.
//!
//! Routes streams between listeners and connectors within the same process using
//! `tokio::io::duplex` pairs.

use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use eloquent_wire::{HostAddress, Scheme};
use once_cell::sync::Lazy;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::{Binding, BoxChannel, Listener};

/// Buffer size of each in-memory stream direction.
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Global registry of memory listeners for cross-connection routing.
static GLOBAL_REGISTRY: Lazy<DashMap<HostAddress, mpsc::UnboundedSender<DuplexStream>>> =
    Lazy::new(DashMap::new);

static NEXT_PORT: AtomicU16 = AtomicU16::new(1);

/// In-process binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBinding;

impl MemoryBinding {
    /// Create a memory binding.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Whether something currently listens at `address`.
    #[must_use]
    pub fn is_listening(address: &HostAddress) -> bool {
        GLOBAL_REGISTRY.contains_key(address)
    }
}

#[async_trait]
impl Binding for MemoryBinding {
    fn scheme(&self) -> Scheme {
        Scheme::Memory
    }

    async fn listen(&self, address: &HostAddress) -> Result<Box<dyn Listener>> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let local_address = if address.port() == 0 {
            loop {
                let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed).max(1);
                let candidate = address.with_port(port);
                if let Entry::Vacant(entry) = GLOBAL_REGISTRY.entry(candidate.clone()) {
                    entry.insert(incoming_tx);
                    break candidate;
                }
            }
        } else {
            match GLOBAL_REGISTRY.entry(address.clone()) {
                Entry::Occupied(_) => {
                    return Err(TransportError::AddressInUse(address.clone()));
                }
                Entry::Vacant(entry) => {
                    entry.insert(incoming_tx);
                    address.clone()
                }
            }
        };

        debug!("Memory listener created at {}", local_address);

        Ok(Box::new(MemoryListener {
            local_address,
            incoming_rx: Mutex::new(incoming_rx),
        }))
    }

    async fn connect(&self, address: &HostAddress) -> Result<BoxChannel> {
        let sender = GLOBAL_REGISTRY
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NoListener(address.clone()))?;

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        sender
            .send(server)
            .map_err(|_| TransportError::NoListener(address.clone()))?;

        debug!("Memory channel connected to {}", address);
        Ok(Box::new(client))
    }
}

struct MemoryListener {
    local_address: HostAddress,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<BoxChannel> {
        let mut incoming = self.incoming_rx.lock().await;
        incoming
            .recv()
            .await
            .map(|stream| Box::new(stream) as BoxChannel)
            .ok_or(TransportError::Closed)
    }

    fn local_address(&self) -> &HostAddress {
        &self.local_address
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing memory listener at {}", self.local_address);
        GLOBAL_REGISTRY.remove(&self.local_address);
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        GLOBAL_REGISTRY.remove(&self.local_address);
    }
}
