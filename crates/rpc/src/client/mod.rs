//! Client side: one session agent per client endpoint, one connection agent per
//! remote object.
//!
//! The agent owns two transports. Calls go out on a single outbound channel, one
//! exchange at a time behind an async gate, so a reply always belongs to the request
//! that preceded it. Events come back on channels the server opens to the agent's
//! own listener.

mod connection;
mod router;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use eloquent_transport::binding_for;
use eloquent_wire::{Endpoint, EndpointMessage, SessionBody, SessionMessage};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::MessageChannel;
use crate::contract::ContractDescription;
use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::serializer::{CborSerializer, Serializer};
use crate::settings::Settings;

pub use self::connection::{ConnectionAgent, Reply};
use self::router::EventRouter;

/// Builder for [`SessionAgent`].
pub struct SessionAgentBuilder {
    client_uri: String,
    server_uri: String,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
}

impl SessionAgentBuilder {
    /// Use `settings`.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `serializer` for every payload. Must match the server's.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Open the session.
    ///
    /// # Errors
    ///
    /// Fails on malformed or mismatched URIs, transport failures, or when the server
    /// does not acknowledge the hello.
    #[instrument(skip(self), fields(client = %self.client_uri, server = %self.server_uri))]
    pub async fn connect(self) -> Result<SessionAgent> {
        let local = Endpoint::parse(&self.client_uri)?;
        let server = Endpoint::parse(&self.server_uri)?;
        if local.scheme != server.scheme {
            return Err(Error::SchemeMismatch {
                client: local.scheme,
                server: server.scheme,
            });
        }

        let binding = binding_for(local.scheme);
        let listener = binding.listen(&local.host).await?;
        let local = Endpoint::new(local.scheme, listener.local_address().clone());

        let cancel = CancellationToken::new();
        let router = Arc::new(EventRouter::new(
            self.serializer.clone(),
            self.settings.max_frame_size,
        ));
        tokio::spawn(router.clone().accept_loop(listener, cancel.clone()));

        let connecting = timeout(self.settings.send_timeout, binding.connect(&server.host));
        let outbound = match connecting.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                cancel.cancel();
                return Err(e.into());
            }
            Err(_) => {
                cancel.cancel();
                return Err(Error::Timeout(self.settings.send_timeout));
            }
        };

        let inner = Arc::new(AgentInner {
            outbound: Mutex::new(MessageChannel::new(outbound, self.settings.max_frame_size)),
            local,
            server,
            settings: self.settings,
            serializer: self.serializer,
            router,
            next_connection_id: AtomicI32::new(1),
            heartbeat_started: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel,
        });

        let agent = SessionAgent { inner };
        match agent.inner.round_trip(&agent.inner.message(SessionBody::Hello), None).await? {
            Answer::Message(SessionBody::HelloAck { acknowledged: true }) => {
                info!("Session open: {} -> {}", agent.inner.local, agent.inner.server);
                Ok(agent)
            }
            Answer::Message(SessionBody::HelloAck { acknowledged: false }) => {
                Err(Error::Connection(format!(
                    "{} refused the session",
                    agent.inner.server
                )))
            }
            other => Err(other.unexpected("a hello acknowledgement")),
        }
    }
}

/// A client's session with one server.
///
/// Dropping the agent disposes it in the background.
pub struct SessionAgent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    local: Endpoint,
    server: Endpoint,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
    outbound: Mutex<MessageChannel>,
    router: Arc<EventRouter>,
    next_connection_id: AtomicI32,
    heartbeat_started: AtomicBool,
    faulted: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

/// What the server answered to an exchange.
pub(crate) enum Answer {
    Message(SessionBody),
    Response(EndpointMessage),
}

impl Answer {
    /// Turn the answers an exchange cannot accept into errors.
    pub fn unexpected(self, expected: &'static str) -> Error {
        match self {
            Self::Message(SessionBody::Exception { fault }) => Error::Remote(fault),
            Self::Message(SessionBody::Error { kind, message }) => {
                Error::Protocol { kind, message }
            }
            Self::Message(other) => Error::UnexpectedMessage {
                expected,
                actual: other.message_type(),
            },
            Self::Response(endpoint) => Error::Connection(format!(
                "unexpected response for {}/{} while waiting for {expected}",
                endpoint.object_id, endpoint.connection_id
            )),
        }
    }
}

impl SessionAgent {
    /// Start building a session from `client_uri` to `server_uri`.
    pub fn builder(
        client_uri: impl Into<String>,
        server_uri: impl Into<String>,
    ) -> SessionAgentBuilder {
        SessionAgentBuilder {
            client_uri: client_uri.into(),
            server_uri: server_uri.into(),
            settings: Settings::default(),
            serializer: Arc::new(CborSerializer::new()),
        }
    }

    /// Open a session with the default serializer.
    ///
    /// `client_uri` is where the server delivers events; port 0 picks a free one.
    ///
    /// # Errors
    ///
    /// As [`SessionAgentBuilder::connect`].
    pub async fn connect(client_uri: &str, server_uri: &str, settings: Settings) -> Result<Self> {
        Self::builder(client_uri, server_uri)
            .settings(settings)
            .connect()
            .await
    }

    /// Open a logical connection to the object hosted under `object_id`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ObjectNotHosted`] if the server hosts no such object.
    pub async fn connect_object(
        &self,
        object_id: &str,
        contract: Arc<ContractDescription>,
    ) -> Result<Arc<ConnectionAgent>> {
        self.inner.connect_object(object_id, contract).await
    }

    /// Connect to `object_id` and wrap the connection in a [`Proxy`].
    ///
    /// # Errors
    ///
    /// As [`SessionAgent::connect_object`].
    pub async fn proxy(
        &self,
        object_id: &str,
        contract: Arc<ContractDescription>,
    ) -> Result<Proxy> {
        Ok(Proxy::new(self.connect_object(object_id, contract).await?))
    }

    /// Where this agent receives events.
    #[must_use]
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.inner.local
    }

    /// The server this agent talks to.
    #[must_use]
    pub fn server_endpoint(&self) -> &Endpoint {
        &self.inner.server
    }

    /// Whether [`SessionAgent::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// End the session: stop heartbeats, tell the server and stop listening.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl Drop for SessionAgent {
    fn drop(&mut self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.dispose().await });
        } else {
            self.inner.disposed.store(true, Ordering::SeqCst);
            self.inner.cancel.cancel();
        }
    }
}

impl AgentInner {
    pub(crate) fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.router
    }

    pub(crate) fn message(&self, body: SessionBody) -> SessionMessage {
        SessionMessage::new(self.local.host.clone(), body)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("session agent"));
        }
        if self.faulted.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "session channel to {} is faulted",
                self.server
            )));
        }
        Ok(())
    }

    pub(crate) async fn connect_object(
        self: &Arc<Self>,
        object_id: &str,
        contract: Arc<ContractDescription>,
    ) -> Result<Arc<ConnectionAgent>> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connect = self.message(SessionBody::Connect {
            object_id: object_id.to_string(),
            connection_id,
        });

        match self.round_trip(&connect, None).await? {
            Answer::Message(SessionBody::HelloAck { acknowledged: true }) => {}
            Answer::Message(SessionBody::HelloAck { acknowledged: false }) => {
                return Err(Error::ObjectNotHosted(object_id.to_string()));
            }
            other => return Err(other.unexpected("a connect acknowledgement")),
        }

        let connection = Arc::new(ConnectionAgent::new(
            self.clone(),
            object_id.to_string(),
            connection_id,
            contract,
        ));
        self.router.register(&connection);
        self.start_heartbeat();
        debug!("Connected to {} as connection {}", object_id, connection_id);
        Ok(connection)
    }

    /// Write one standalone message.
    pub(crate) async fn send(&self, message: &SessionMessage) -> Result<()> {
        self.ensure_usable()?;
        let mut channel = self.outbound.lock().await;
        let result = self.write(&mut channel, message, None).await;
        self.check(result)
    }

    /// Write a marker and its endpoint message without waiting for a reply.
    pub(crate) async fn send_pair(
        &self,
        marker: &SessionMessage,
        endpoint: &EndpointMessage,
    ) -> Result<()> {
        self.ensure_usable()?;
        let mut channel = self.outbound.lock().await;
        let result = self.write(&mut channel, marker, Some(endpoint)).await;
        self.check(result)
    }

    /// Write a message (and endpoint message) and read the reply under one gate hold.
    pub(crate) async fn round_trip(
        &self,
        message: &SessionMessage,
        endpoint: Option<&EndpointMessage>,
    ) -> Result<Answer> {
        self.ensure_usable()?;
        let mut channel = self.outbound.lock().await;
        let result = async {
            self.write(&mut channel, message, endpoint).await?;
            self.read_answer(&mut channel).await
        }
        .await;
        self.check(result)
    }

    async fn write(
        &self,
        channel: &mut MessageChannel,
        message: &SessionMessage,
        endpoint: Option<&EndpointMessage>,
    ) -> Result<()> {
        let limit = self.settings.send_timeout;
        let written = match endpoint {
            Some(endpoint) => timeout(limit, channel.send_pair(message, endpoint)).await,
            None => timeout(limit, channel.send(message)).await,
        };
        written.map_err(|_| Error::Timeout(limit))?
    }

    async fn read_answer(&self, channel: &mut MessageChannel) -> Result<Answer> {
        let limit = self.settings.receive_timeout;
        let reply = timeout(limit, channel.receive())
            .await
            .map_err(|_| Error::Timeout(limit))??
            .ok_or_else(|| {
                Error::Connection(format!("{} closed the session channel", self.server))
            })?;

        if reply.body == SessionBody::Response {
            let endpoint = timeout(limit, channel.receive_endpoint())
                .await
                .map_err(|_| Error::Timeout(limit))??;
            Ok(Answer::Response(endpoint))
        } else {
            Ok(Answer::Message(reply.body))
        }
    }

    /// A failed exchange leaves the stream in an unknown state; refuse further use.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !self.faulted.swap(true, Ordering::SeqCst) {
                warn!("Session channel to {} faulted: {}", self.server, e);
            }
        }
        result
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let Some(period) = self.settings.heartbeat_interval() else {
            return;
        };
        if self.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            period,
            self.cancel.clone(),
        ));
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let mut channel = self.outbound.lock().await;
        if !self.faulted.load(Ordering::SeqCst) {
            let terminate = self.message(SessionBody::TerminateSession);
            // The server may already be gone
            if let Err(e) = self.write(&mut channel, &terminate, None).await {
                debug!("Could not send terminate to {}: {}", self.server, e);
            }
        }
        if let Err(e) = channel.close().await {
            debug!("Closing session channel failed: {}", e);
        }
        info!("Session {} -> {} disposed", self.local, self.server);
    }
}

async fn heartbeat_loop(
    inner: std::sync::Weak<AgentInner>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.send(&inner.message(SessionBody::Heartbeat)).await {
            debug!("Stopping heartbeats: {}", e);
            break;
        }
    }
}
