//! Inbound side of a client session: the listener the server connects back to.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use eloquent_transport::{BoxChannel, Listener, TransportError};
use eloquent_wire::{EndpointKind, EndpointMessage, SessionBody};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ConnectionAgent;
use crate::channel::MessageChannel;
use crate::error::{Error, Result};
use crate::serializer::Serializer;

/// Routes events arriving on reverse channels to their connection agents.
pub(crate) struct EventRouter {
    serializer: Arc<dyn Serializer>,
    connections: DashMap<i32, Weak<ConnectionAgent>>,
    max_frame_size: usize,
}

impl EventRouter {
    pub fn new(serializer: Arc<dyn Serializer>, max_frame_size: usize) -> Self {
        Self {
            serializer,
            connections: DashMap::new(),
            max_frame_size,
        }
    }

    pub fn register(&self, connection: &Arc<ConnectionAgent>) {
        self.connections
            .insert(connection.connection_id(), Arc::downgrade(connection));
    }

    pub fn unregister(&self, connection_id: i32) {
        self.connections.remove(&connection_id);
    }

    /// Accept reverse channels until cancelled, then close the listener.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: Box<dyn Listener>,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    tokio::spawn(self.clone().serve(stream, cancel.clone()));
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!("Accepting reverse channel failed: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = listener.close().await {
            debug!("Closing client listener failed: {}", e);
        }
    }

    async fn serve(self: Arc<Self>, stream: BoxChannel, cancel: CancellationToken) {
        let mut channel = MessageChannel::new(stream, self.max_frame_size);
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = self.next_event(&mut channel) => received,
            };
            match received {
                Ok(Some(endpoint)) => self.route(endpoint),
                Ok(None) => {
                    debug!("Server closed the reverse channel");
                    break;
                }
                Err(e) => {
                    warn!("Dropping reverse channel: {}", e);
                    break;
                }
            }
        }
    }

    async fn next_event(&self, channel: &mut MessageChannel) -> Result<Option<EndpointMessage>> {
        let Some(marker) = channel.receive().await? else {
            return Ok(None);
        };
        if marker.body != SessionBody::Event {
            return Err(Error::UnexpectedMessage {
                expected: "an event marker",
                actual: marker.body.message_type(),
            });
        }
        let endpoint = channel.receive_endpoint().await?;
        if endpoint.kind != EndpointKind::Event {
            return Err(Error::Connection(format!(
                "expected an event payload, got {:?}",
                endpoint.kind
            )));
        }
        Ok(Some(endpoint))
    }

    fn route(&self, endpoint: EndpointMessage) {
        let call = match self.serializer.deserialize_call(&endpoint.payload) {
            Ok(call) => call,
            Err(e) => {
                warn!("Undecodable event for {}: {}", endpoint.object_id, e);
                return;
            }
        };

        let target = self
            .connections
            .get(&endpoint.connection_id)
            .map(|entry| entry.value().clone());
        match target.as_ref().and_then(Weak::upgrade) {
            Some(connection) if connection.object_id() == endpoint.object_id => {
                connection.dispatch_event(call);
            }
            Some(_) => warn!(
                "Event {} for {} arrived on connection {} of another object",
                call.operation_name, endpoint.object_id, endpoint.connection_id
            ),
            None => debug!(
                "Event {} for closed connection {}",
                call.operation_name, endpoint.connection_id
            ),
        }
    }
}
