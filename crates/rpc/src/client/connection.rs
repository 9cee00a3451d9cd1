//! One logical connection to one remote object over a shared session.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eloquent_wire::{EndpointKind, EndpointMessage, SessionBody, SessionMessage};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{AgentInner, Answer};
use crate::contract::{ContractDescription, EventShape};
use crate::error::{CodecError, Error, Result};
use crate::proxy::{EventHandler, EventNotification, Proxy};
use crate::serializer::{CallInfo, Value, from_value};

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Returned value; `Null` for void operations.
    Value(Value),
    /// The operation returned an object hosted under this id.
    Object(String),
    /// Nothing comes back: a notification or a subscription change.
    Empty,
}

impl Reply {
    /// Decode the returned value as `R`. [`Reply::Empty`] decodes like `Null`.
    ///
    /// # Errors
    ///
    /// Fails if the value does not have the shape of `R`, or if an object reference
    /// came back.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R> {
        match self {
            Self::Value(value) => Ok(from_value(value)?),
            Self::Empty => Ok(from_value(&Value::Null)?),
            Self::Object(object_id) => Err(CodecError::DeserializationFailed(format!(
                "got a reference to hosted object {object_id:?}, not a value"
            ))
            .into()),
        }
    }
}

/// Client end of one logical connection.
///
/// Shares the session's outbound channel with every other connection of the agent.
pub struct ConnectionAgent {
    session: Arc<AgentInner>,
    object_id: String,
    connection_id: i32,
    contract: Arc<ContractDescription>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    subscription_gate: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl ConnectionAgent {
    pub(super) fn new(
        session: Arc<AgentInner>,
        object_id: String,
        connection_id: i32,
        contract: Arc<ContractDescription>,
    ) -> Self {
        Self {
            session,
            object_id,
            connection_id,
            contract,
            handlers: RwLock::new(HashMap::new()),
            subscription_gate: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Id of the remote object.
    #[must_use]
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Id the agent assigned to this connection.
    #[must_use]
    pub const fn connection_id(&self) -> i32 {
        self.connection_id
    }

    /// Contract of the remote object.
    #[must_use]
    pub fn contract(&self) -> &Arc<ContractDescription> {
        &self.contract
    }

    pub(crate) fn session(&self) -> &Arc<AgentInner> {
        &self.session
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::Disposed("connection"))
        } else {
            Ok(())
        }
    }

    fn endpoint(&self, kind: EndpointKind, call: &CallInfo) -> Result<EndpointMessage> {
        let payload = self.session.serializer().serialize_call(call)?;
        Ok(EndpointMessage::new(
            kind,
            self.object_id.clone(),
            self.connection_id,
            payload,
        ))
    }

    /// Invoke `operation` and wait for its result.
    ///
    /// # Errors
    ///
    /// [`Error::Remote`] when the operation failed on the server, [`Error::Protocol`]
    /// when the server could not route it, connectivity errors otherwise.
    pub async fn call(&self, operation: &str, parameters: Vec<Value>) -> Result<Reply> {
        self.ensure_open()?;
        let endpoint = self.endpoint(EndpointKind::Request, &CallInfo::new(operation, parameters))?;
        let marker = self.session.message(SessionBody::Request);

        match self.session.round_trip(&marker, Some(&endpoint)).await? {
            Answer::Response(response) => {
                let values = self.session.serializer().deserialize(&response.payload)?;
                Ok(Reply::Value(values.into_iter().next().unwrap_or(Value::Null)))
            }
            Answer::Message(SessionBody::EloquentObject { object_id }) => {
                Ok(Reply::Object(object_id))
            }
            other => Err(other.unexpected("a call reply")),
        }
    }

    /// Invoke `operation` without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Only local and connectivity errors; the server never answers.
    pub async fn notify(&self, operation: &str, parameters: Vec<Value>) -> Result<()> {
        self.ensure_open()?;
        let endpoint =
            self.endpoint(EndpointKind::Notification, &CallInfo::new(operation, parameters))?;
        self.session
            .send_pair(&self.session.message(SessionBody::Request), &endpoint)
            .await
    }

    /// Ask the server to deliver `event` to this connection.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] with `EventNotFound`, `EventAlreadySubscribed` or
    /// `ObjectNotFound` when refused.
    pub async fn subscribe_remote(&self, event: &str) -> Result<()> {
        self.ensure_open()?;
        let message = self.session.message(SessionBody::Subscribe {
            object_id: self.object_id.clone(),
            connection_id: self.connection_id,
            event: event.to_string(),
        });
        self.expect_ack(&format!("subscribe {event}"), message).await
    }

    /// Ask the server to stop delivering `event`.
    ///
    /// # Errors
    ///
    /// Only local and connectivity errors; unknown subscriptions are acknowledged.
    pub async fn unsubscribe_remote(&self, event: &str) -> Result<()> {
        self.ensure_open()?;
        let message = self.session.message(SessionBody::Unsubscribe {
            object_id: self.object_id.clone(),
            connection_id: self.connection_id,
            event: event.to_string(),
        });
        self.expect_ack(&format!("unsubscribe {event}"), message).await
    }

    async fn expect_ack(&self, what: &str, message: SessionMessage) -> Result<()> {
        match self.session.round_trip(&message, None).await? {
            Answer::Message(SessionBody::Ack) => {
                debug!("{} acknowledged on connection {}", what, self.connection_id);
                Ok(())
            }
            other => Err(other.unexpected("an acknowledgement")),
        }
    }

    /// Register a local handler, subscribing on the server for the first one.
    ///
    /// Subscription changes on one connection run one at a time, so a handler is never
    /// left registered without a server subscription behind it.
    pub(crate) async fn add_handler(&self, event: &str, handler: EventHandler) -> Result<()> {
        let _gate = self.subscription_gate.lock().await;
        if self.push_handler(event, handler.clone()) {
            if let Err(e) = self.subscribe_remote(event).await {
                self.drop_handler(event, &handler);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove a local handler, unsubscribing on the server after the last one.
    pub(crate) async fn remove_handler(&self, event: &str, handler: &EventHandler) -> Result<()> {
        let _gate = self.subscription_gate.lock().await;
        match self.drop_handler(event, handler) {
            Some(true) => self.unsubscribe_remote(event).await?,
            Some(false) => {}
            None => debug!("Handler for {} was not registered", event),
        }
        Ok(())
    }

    fn push_handler(&self, event: &str, handler: EventHandler) -> bool {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(event.to_string()).or_default();
        list.push(handler);
        list.len() == 1
    }

    /// `None` if `handler` was not registered, otherwise whether `event` has none left.
    fn drop_handler(&self, event: &str, handler: &EventHandler) -> Option<bool> {
        let mut handlers = self.handlers.write();
        let list = handlers.get_mut(event)?;
        let position = list.iter().position(|h| Arc::ptr_eq(h, handler))?;
        list.remove(position);
        let empty = list.is_empty();
        if empty {
            handlers.remove(event);
        }
        Some(empty)
    }

    /// Number of local handlers for `event`.
    #[must_use]
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Hand an incoming event to every local handler.
    pub(crate) fn dispatch_event(self: &Arc<Self>, call: CallInfo) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&call.operation_name)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(
                "No handlers for {} on connection {}",
                call.operation_name, self.connection_id
            );
            return;
        }

        let shape = self
            .contract
            .event(&call.operation_name)
            .map_or(EventShape::Plain, |event| event.shape);
        let (sender, parameters) = match shape {
            EventShape::Standard => (
                Some(Proxy::new(self.clone())),
                call.parameters.into_iter().skip(1).collect(),
            ),
            EventShape::Plain => (None, call.parameters),
        };
        let notification = EventNotification {
            event_name: call.operation_name,
            sender,
            parameters,
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&notification))).is_err() {
                warn!("Handler for {} panicked", notification.event_name);
            }
        }
    }

    /// Close the connection on the server. Later calls fail with [`Error::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.router().unregister(self.connection_id);
        self.handlers.write().clear();

        let disconnect = self.session.message(SessionBody::Disconnect {
            object_id: self.object_id.clone(),
            connection_id: self.connection_id,
        });
        if let Err(e) = self.session.send(&disconnect).await {
            debug!("Could not send disconnect for {}: {}", self.object_id, e);
        }
    }

    /// Whether [`ConnectionAgent::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionAgent {
    fn drop(&mut self) {
        self.session.router().unregister(self.connection_id);
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("object_id", &self.object_id)
            .field("connection_id", &self.connection_id)
            .field("contract", &self.contract.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use eloquent_wire::ErrorKind;

    use super::*;
    use crate::client::SessionAgent;
    use crate::event::Event;
    use crate::hosted::HostedContract;
    use crate::repository::Registration;
    use crate::server::Server;
    use crate::settings::Settings;

    const COUNTER_ID: &str = "counter";

    struct Counter {
        ticked: Event<(i32,)>,
    }

    async fn serve_counter() -> (Server, Arc<HostedContract<Counter>>, Registration) {
        let server = Server::bind("memory://127.0.0.1:0", Settings::default())
            .await
            .unwrap();
        let contract = HostedContract::<Counter>::builder("Counter")
            .method("Next", |_: &Counter, (): ()| Ok(1))
            .event("Ticked", EventShape::Plain, |counter: &Counter| {
                &counter.ticked
            })
            .build()
            .unwrap();
        let counter = Arc::new(Counter {
            ticked: Event::new(),
        });
        let registration = server
            .host(COUNTER_ID, counter, contract.clone())
            .unwrap();
        (server, contract, registration)
    }

    async fn agent(server: &Server) -> SessionAgent {
        SessionAgent::connect(
            "memory://127.0.0.1:0",
            &server.endpoint().to_string(),
            Settings::default(),
        )
        .await
        .unwrap()
    }

    fn is_invalid_request<T>(result: &Result<T>) -> bool {
        matches!(
            result,
            Err(Error::Protocol {
                kind: ErrorKind::InvalidRequest,
                ..
            })
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_refuses_unannounced_connections() {
        let _ = tracing_subscriber::fmt::try_init();
        let (server, contract, _registration) = serve_counter().await;
        let agent = agent(&server).await;
        let description = contract.description().clone();

        let announced = agent
            .connect_object(COUNTER_ID, description.clone())
            .await
            .unwrap();
        assert_eq!(
            announced.call("Next", Vec::new()).await.unwrap(),
            Reply::Value(Value::from(1))
        );

        // An id the server never saw in a Connect
        let unknown = ConnectionAgent::new(
            agent.inner.clone(),
            COUNTER_ID.to_string(),
            announced.connection_id() + 100,
            description.clone(),
        );
        assert!(is_invalid_request(&unknown.call("Next", Vec::new()).await));
        assert!(is_invalid_request(&unknown.subscribe_remote("Ticked").await));
        let adapter = server.repository().try_get_object(COUNTER_ID).unwrap();
        assert_eq!(adapter.subscriber_count("Ticked"), 0);

        // An id the client already disconnected
        let closed_id = announced.connection_id();
        announced.dispose().await;
        let reused = ConnectionAgent::new(
            agent.inner.clone(),
            COUNTER_ID.to_string(),
            closed_id,
            description,
        );
        assert!(is_invalid_request(&reused.call("Next", Vec::new()).await));

        agent.dispose().await;
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_subscribes_share_a_refused_outcome() {
        let _ = tracing_subscriber::fmt::try_init();
        let (server, _contract, _registration) = serve_counter().await;
        let agent = agent(&server).await;

        // The client believes in an event the server does not raise
        let description = Arc::new(
            ContractDescription::builder("Counter")
                .method("Next", 0)
                .event("Ticked", EventShape::Plain)
                .event("Overflowed", EventShape::Plain)
                .build()
                .unwrap(),
        );
        let counter = agent.proxy(COUNTER_ID, description).await.unwrap();

        let (first, second) = tokio::join!(
            counter.subscribe("Overflowed", |_: &EventNotification| {}),
            counter.subscribe("Overflowed", |_: &EventNotification| {}),
        );
        for result in [first, second] {
            assert!(matches!(
                result,
                Err(Error::Protocol {
                    kind: ErrorKind::EventNotFound,
                    ..
                })
            ));
        }
        assert_eq!(counter.connection().handler_count("Overflowed"), 0);

        // A refused event does not disturb a real one
        counter
            .subscribe("Ticked", |_: &EventNotification| {})
            .await
            .unwrap();
        assert_eq!(counter.connection().handler_count("Ticked"), 1);

        agent.dispose().await;
        server.shutdown().await;
    }
}
