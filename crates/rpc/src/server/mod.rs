//! Hosting side: accepts client sessions and routes their calls to hosted objects.
//!
//! Every accepted stream gets its own read loop. A client announces itself with
//! `Hello`; the server then connects back to the client's address, which becomes
//! the session's reverse channel for events. Sessions are keyed by that address.

mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use eloquent_transport::{Binding, BoxChannel, Listener, TransportError, binding_for};
use eloquent_wire::{
    Endpoint, EndpointKind, EndpointMessage, ErrorKind, Fault, HostAddress, SessionBody,
    SessionMessage,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{CallReply, ObjectAdapter};
use crate::channel::MessageChannel;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::hosted::HostedContract;
use crate::repository::{ObjectsRepository, Registration};
use crate::serializer::{CborSerializer, Serializer};
use crate::settings::Settings;

use self::session::{Session, SessionParams, Termination};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Builder for [`Server`].
pub struct ServerBuilder {
    uri: String,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
}

impl ServerBuilder {
    /// Start building a server listening on `uri` (`scheme://ip:port`).
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            settings: Settings::default(),
            serializer: Arc::new(CborSerializer::new()),
        }
    }

    /// Use `settings`.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `serializer` for every payload.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Listen and start accepting sessions.
    ///
    /// # Errors
    ///
    /// Fails on a malformed URI or if the address cannot be bound.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub async fn bind(self) -> Result<Server> {
        let requested = Endpoint::parse(&self.uri)?;
        let binding = binding_for(requested.scheme);
        let listener = binding.listen(&requested.host).await?;
        let endpoint = Endpoint::new(requested.scheme, listener.local_address().clone());

        let (terminations, terminations_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            endpoint,
            settings: self.settings,
            serializer: self.serializer,
            binding,
            repository: ObjectsRepository::new(),
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            terminations,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(inner.clone(), listener));
        tokio::spawn(termination_loop(
            Arc::downgrade(&inner),
            terminations_rx,
            inner.cancel.clone(),
        ));
        tokio::spawn(removal_loop(
            Arc::downgrade(&inner),
            inner.repository.removals(),
            inner.cancel.clone(),
        ));

        info!("Server listening on {}", inner.endpoint);
        Ok(Server { inner })
    }
}

/// Hosts objects and serves client sessions.
///
/// Dropping the server stops it, as [`Server::shutdown`].
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    endpoint: Endpoint,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
    binding: Arc<dyn Binding>,
    repository: ObjectsRepository,
    sessions: RwLock<HashMap<HostAddress, Arc<Session>>>,
    next_session_id: AtomicU64,
    terminations: mpsc::UnboundedSender<Termination>,
    cancel: CancellationToken,
}

impl Server {
    /// Listen on `uri` with the default serializer.
    ///
    /// # Errors
    ///
    /// Fails on a malformed URI or if the address cannot be bound.
    pub async fn bind(uri: &str, settings: Settings) -> Result<Self> {
        ServerBuilder::new(uri).settings(settings).bind().await
    }

    /// Start building a server.
    pub fn builder(uri: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(uri)
    }

    /// Where the server listens, with any port 0 resolved.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// The hosted objects.
    #[must_use]
    pub fn repository(&self) -> &ObjectsRepository {
        &self.inner.repository
    }

    /// Host `instance` under `object_id`, invoked inline on the I/O tasks.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ObjectAlreadyHosted`] if the id is taken.
    pub fn host<T: Send + Sync + 'static>(
        &self,
        object_id: impl Into<String>,
        instance: Arc<T>,
        contract: Arc<HostedContract<T>>,
    ) -> Result<Registration> {
        self.host_with(object_id.into(), instance, contract, None)
    }

    /// Host `instance` under `object_id`, invoked only on `context`'s thread.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ObjectAlreadyHosted`] if the id is taken.
    pub fn host_on<T: Send + Sync + 'static>(
        &self,
        object_id: impl Into<String>,
        instance: Arc<T>,
        contract: Arc<HostedContract<T>>,
        context: ExecutionContext,
    ) -> Result<Registration> {
        self.host_with(object_id.into(), instance, contract, Some(context))
    }

    fn host_with<T: Send + Sync + 'static>(
        &self,
        object_id: String,
        instance: Arc<T>,
        contract: Arc<HostedContract<T>>,
        context: Option<ExecutionContext>,
    ) -> Result<Registration> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Disposed("server"));
        }
        info!(
            "Hosting {} as {}",
            contract.description().name(),
            object_id
        );
        self.inner
            .repository
            .add(ObjectAdapter::new(object_id, instance, contract, context))
    }

    /// Number of live client sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Addresses of live client sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<HostAddress> {
        self.inner.sessions.read().keys().cloned().collect()
    }

    /// Stop accepting, end every session and unhost every object.
    pub async fn shutdown(&self) {
        self.inner.stop();
        // Let the accept loop observe cancellation and close the listener
        tokio::task::yield_now().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl ServerInner {
    fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Stopping server on {}", self.endpoint);
        self.cancel.cancel();
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.dispose();
        }
        self.repository.clear();
    }

    fn session(&self, client: &HostAddress) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .get(client)
            .filter(|session| !session.is_terminated())
            .cloned()
    }

    async fn open_session(&self, client: &HostAddress) -> bool {
        if self.session(client).is_some() {
            debug!("Repeated hello from {}", client);
            return true;
        }

        let opened = Session::open(SessionParams {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            local: self.endpoint.host.clone(),
            binding: self.binding.as_ref(),
            settings: &self.settings,
            serializer: self.serializer.clone(),
            terminations: self.terminations.clone(),
            cancel: self.cancel.child_token(),
        })
        .await;

        match opened {
            Ok(session) => {
                let replaced = self.sessions.write().insert(client.clone(), session);
                if let Some(replaced) = replaced {
                    replaced.dispose();
                }
                true
            }
            Err(e) => {
                warn!("Could not connect back to {}: {}", client, e);
                false
            }
        }
    }

    fn remove_session(&self, termination: &Termination) {
        let removed = {
            let mut sessions = self.sessions.write();
            let current = sessions
                .get(&termination.client)
                .is_some_and(|session| session.id() == termination.session_id);
            if current {
                sessions.remove(&termination.client)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            session.dispose();
        }
    }

    fn reply(&self, body: SessionBody) -> SessionMessage {
        SessionMessage::new(self.endpoint.host.clone(), body)
    }

    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> SessionMessage {
        self.reply(SessionBody::Error {
            kind,
            message: message.into(),
        })
    }

    /// Read loop for one accepted stream.
    async fn serve(self: Arc<Self>, stream: BoxChannel) {
        let mut channel = MessageChannel::new(stream, self.settings.max_frame_size);
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = channel.receive() => received,
            };
            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Client stream closed");
                    break;
                }
                Err(e) => {
                    warn!("Dropping client stream: {}", e);
                    break;
                }
            };
            if let Err(e) = self.dispatch(&mut channel, message).await {
                warn!("Dropping client stream: {}", e);
                break;
            }
        }
    }

    async fn dispatch(&self, channel: &mut MessageChannel, message: SessionMessage) -> Result<()> {
        let sender = message.sender;
        match message.body {
            SessionBody::Hello => {
                let acknowledged = self.open_session(&sender).await;
                channel
                    .send(&self.reply(SessionBody::HelloAck { acknowledged }))
                    .await
            }
            SessionBody::Heartbeat => {
                match self.session(&sender) {
                    Some(session) => session.heartbeat(),
                    None => debug!("Heartbeat from unknown client {}", sender),
                }
                Ok(())
            }
            SessionBody::TerminateSession => {
                if let Some(session) = self.session(&sender) {
                    info!("Client {} ended its session", sender);
                    session.terminate();
                }
                Ok(())
            }
            SessionBody::Connect {
                object_id,
                connection_id,
            } => {
                let reply = match self.session(&sender) {
                    None => self.error(ErrorKind::SessionNotFound, sender.to_string()),
                    Some(session) => {
                        let acknowledged = self.repository.contains(&object_id);
                        if acknowledged {
                            session.connect(&object_id, connection_id);
                        }
                        self.reply(SessionBody::HelloAck { acknowledged })
                    }
                };
                channel.send(&reply).await
            }
            SessionBody::Disconnect {
                object_id,
                connection_id,
            } => {
                if let Some(session) = self.session(&sender) {
                    session.disconnect(&object_id, connection_id);
                }
                Ok(())
            }
            SessionBody::Request => {
                let endpoint = channel.receive_endpoint().await?;
                self.handle_request(channel, &sender, endpoint).await
            }
            SessionBody::Subscribe {
                object_id,
                connection_id,
                event,
            } => {
                let reply = match (
                    self.session(&sender),
                    self.repository.try_get_object(&object_id),
                ) {
                    (None, _) => self.error(ErrorKind::SessionNotFound, sender.to_string()),
                    (Some(_), None) => self.error(ErrorKind::ObjectNotFound, object_id),
                    (Some(session), Some(_))
                        if !session.is_connected(&object_id, connection_id) =>
                    {
                        self.error(
                            ErrorKind::InvalidRequest,
                            unknown_connection(&object_id, connection_id),
                        )
                    }
                    (Some(session), Some(adapter)) => {
                        match session.subscribe(&adapter, connection_id, &event) {
                            Ok(()) => self.reply(SessionBody::Ack),
                            Err(kind) => self.error(kind, format!("{object_id}.{event}")),
                        }
                    }
                };
                channel.send(&reply).await
            }
            SessionBody::Unsubscribe {
                object_id,
                connection_id,
                event,
            } => {
                let reply = match self.session(&sender) {
                    None => self.error(ErrorKind::SessionNotFound, sender.to_string()),
                    Some(session) => {
                        let adapter = self.repository.try_get_object(&object_id);
                        session.unsubscribe(adapter.as_ref(), &object_id, connection_id, &event);
                        self.reply(SessionBody::Ack)
                    }
                };
                channel.send(&reply).await
            }
            other => Err(Error::UnexpectedMessage {
                expected: "a client message",
                actual: other.message_type(),
            }),
        }
    }

    async fn handle_request(
        &self,
        channel: &mut MessageChannel,
        sender: &HostAddress,
        endpoint: EndpointMessage,
    ) -> Result<()> {
        let two_way = match endpoint.kind {
            EndpointKind::Request => true,
            EndpointKind::Notification => false,
            other => {
                return Err(Error::Connection(format!(
                    "unexpected {other:?} endpoint message after a request marker"
                )));
            }
        };

        let reply = self.serve_request(sender, endpoint, two_way).await;
        match reply {
            Some(Reply::Message(message)) => channel.send(&message).await,
            Some(Reply::Response(marker, response)) => channel.send_pair(&marker, &response).await,
            None => Ok(()),
        }
    }

    async fn serve_request(
        &self,
        sender: &HostAddress,
        endpoint: EndpointMessage,
        two_way: bool,
    ) -> Option<Reply> {
        let Some(session) = self.session(sender) else {
            return two_way.then(|| {
                Reply::Message(self.error(ErrorKind::SessionNotFound, sender.to_string()))
            });
        };

        let call = match self.serializer.deserialize_call(&endpoint.payload) {
            Ok(call) => call,
            Err(e) => {
                warn!("Undecodable call from {}: {}", sender, e);
                return two_way
                    .then(|| Reply::Message(self.error(ErrorKind::InvalidRequest, e.to_string())));
            }
        };

        let Some(adapter) = self.repository.try_get_object(&endpoint.object_id) else {
            return two_way.then(|| {
                Reply::Message(self.error(ErrorKind::ObjectNotFound, endpoint.object_id.clone()))
            });
        };

        if !session.is_connected(&endpoint.object_id, endpoint.connection_id) {
            let connection = unknown_connection(&endpoint.object_id, endpoint.connection_id);
            debug!("Refusing {} from {}: {}", call.operation_name, sender, connection);
            return two_way
                .then(|| Reply::Message(self.error(ErrorKind::InvalidRequest, connection)));
        }

        if !two_way {
            adapter.handle_notification(call).await;
            return None;
        }

        let reply = match adapter.handle_call(call, &self.repository).await {
            CallReply::Value(value) => match self.serializer.serialize(&[value]) {
                Ok(payload) => Reply::Response(
                    self.reply(SessionBody::Response),
                    EndpointMessage::new(
                        EndpointKind::Response,
                        endpoint.object_id,
                        endpoint.connection_id,
                        payload,
                    ),
                ),
                Err(e) => Reply::Message(self.reply(SessionBody::Exception {
                    fault: Fault::from_error(&e),
                })),
            },
            CallReply::Object(object_id) => {
                Reply::Message(self.reply(SessionBody::EloquentObject { object_id }))
            }
            CallReply::Fault(fault) => Reply::Message(self.reply(SessionBody::Exception { fault })),
            CallReply::OperationNotFound(operation) => {
                Reply::Message(self.error(ErrorKind::OperationNotFound, operation))
            }
            CallReply::ObjectNotFound(object_id) => {
                Reply::Message(self.error(ErrorKind::ObjectNotFound, object_id))
            }
        };
        Some(reply)
    }
}

fn unknown_connection(object_id: &str, connection_id: i32) -> String {
    format!("connection {connection_id} to {object_id} is not open")
}

enum Reply {
    Message(SessionMessage),
    Response(SessionMessage, EndpointMessage),
}

async fn accept_loop(inner: Arc<ServerInner>, listener: Box<dyn Listener>) {
    loop {
        let accepted = tokio::select! {
            () = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                tokio::spawn(inner.clone().serve(stream));
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Accept failed on {}: {}", inner.endpoint, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    if let Err(e) = listener.close().await {
        warn!("Closing listener failed: {}", e);
    }
    debug!("Accept loop on {} stopped", inner.endpoint);
}

async fn termination_loop(
    inner: Weak<ServerInner>,
    mut terminations: mpsc::UnboundedReceiver<Termination>,
    cancel: CancellationToken,
) {
    loop {
        let termination = tokio::select! {
            () = cancel.cancelled() => break,
            termination = terminations.recv() => termination,
        };
        let (Some(termination), Some(inner)) = (termination, inner.upgrade()) else {
            break;
        };
        inner.remove_session(&termination);
    }
}

async fn removal_loop(
    inner: Weak<ServerInner>,
    mut removals: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let removal = tokio::select! {
            () = cancel.cancelled() => break,
            removal = removals.recv() => removal,
        };
        let object_id = match removal {
            Ok(object_id) => object_id,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} object removals", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let sessions: Vec<Arc<Session>> = inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.drop_object(&object_id);
        }
    }
}
