//! Client-side stand-in for a remote object.
//!
//! [`Proxy::invoke`] is the dispatcher every member access goes through. It
//! classifies the member against the contract and picks the wire exchange:
//!
//! | member | exchange |
//! |---|---|
//! | `get_X` | call |
//! | `set_X` | call, or notify when the property is one-way |
//! | method | call, or notify when one-way |
//! | `add_X` / `remove_X` | local handlers; subscribe on first add, unsubscribe on last remove |
//!
//! Anything else, including `raise_` and `op_` members, is refused.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::client::{ConnectionAgent, Reply};
use crate::contract::{
    ADD_PREFIX, ContractDescription, GETTER_PREFIX, REMOVE_PREFIX, RESERVED_PREFIXES, SETTER_PREFIX,
};
use crate::error::{Error, Result};
use crate::serializer::{ObjectRef, Parameters, Value, to_value};

/// Local event handler.
pub type EventHandler = Arc<dyn Fn(&EventNotification) + Send + Sync>;

/// One event occurrence delivered to a local handler.
#[derive(Clone)]
pub struct EventNotification {
    /// Event name.
    pub event_name: String,
    /// The proxy of the raising object, for standard-shaped events.
    pub sender: Option<Proxy>,
    /// Event arguments, without the sender slot.
    pub parameters: Vec<Value>,
}

impl EventNotification {
    /// Decode the arguments as a typed tuple.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not have the shape of `A`.
    pub fn arguments<A: Parameters>(&self) -> Result<A> {
        Ok(A::from_values(&self.parameters)?)
    }
}

impl std::fmt::Debug for EventNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotification")
            .field("event_name", &self.event_name)
            .field("sender", &self.sender.as_ref().map(Proxy::object_id))
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Arguments of a member invocation.
pub enum Arguments {
    /// Operation parameters.
    Values(Vec<Value>),
    /// Handler for an `add_` or `remove_` member.
    Handler(EventHandler),
}

/// Proxy for one remote object.
///
/// Clones share the connection. Dropping a proxy does not close it; call
/// [`Proxy::dispose`].
#[derive(Clone)]
pub struct Proxy {
    connection: Arc<ConnectionAgent>,
}

impl Proxy {
    /// Wrap an open connection.
    #[must_use]
    pub const fn new(connection: Arc<ConnectionAgent>) -> Self {
        Self { connection }
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionAgent> {
        &self.connection
    }

    /// Id of the remote object.
    #[must_use]
    pub fn object_id(&self) -> &str {
        self.connection.object_id()
    }

    /// Connection id of this proxy.
    #[must_use]
    pub fn connection_id(&self) -> i32 {
        self.connection.connection_id()
    }

    /// Contract of the remote object.
    #[must_use]
    pub fn contract(&self) -> &Arc<ContractDescription> {
        self.connection.contract()
    }

    /// Reference to pass this object as a call parameter.
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.object_id())
    }

    /// Whether both proxies share one connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }

    /// Dispatch an invocation of `member`.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] for members the contract does not declare and for
    /// reserved members; otherwise whatever the exchange fails with.
    pub async fn invoke(&self, member: &str, arguments: Arguments) -> Result<Reply> {
        if RESERVED_PREFIXES
            .iter()
            .any(|prefix| member.starts_with(prefix))
        {
            return Err(Error::NotSupported(member.to_string()));
        }

        match arguments {
            Arguments::Values(values) => self.invoke_operation(member, values).await,
            Arguments::Handler(handler) => {
                if let Some(event) = member.strip_prefix(ADD_PREFIX) {
                    self.add_handler(event, handler).await
                } else if let Some(event) = member.strip_prefix(REMOVE_PREFIX) {
                    self.remove_handler(event, &handler).await
                } else {
                    Err(Error::NotSupported(member.to_string()))
                }
            }
        }
    }

    async fn invoke_operation(&self, member: &str, values: Vec<Value>) -> Result<Reply> {
        let Some(operation) = self.contract().operation(member, values.len()) else {
            return Err(Error::NotSupported(format!("{member}/{}", values.len())));
        };

        if !operation.one_way {
            return self.connection.call(member, values).await;
        }

        let is_setter = member
            .strip_prefix(SETTER_PREFIX)
            .is_some_and(|name| self.contract().property(name).is_some());
        match self.connection.notify(member, values).await {
            Ok(()) => Ok(Reply::Empty),
            Err(e) if is_setter => {
                warn!("One-way write {} on {} failed: {}", member, self.object_id(), e);
                Ok(Reply::Empty)
            }
            Err(e) => Err(e),
        }
    }

    async fn add_handler(&self, event: &str, handler: EventHandler) -> Result<Reply> {
        if self.contract().event(event).is_none() {
            return Err(Error::NotSupported(format!("{ADD_PREFIX}{event}")));
        }
        self.connection.add_handler(event, handler).await?;
        Ok(Reply::Empty)
    }

    async fn remove_handler(&self, event: &str, handler: &EventHandler) -> Result<Reply> {
        if self.contract().event(event).is_none() {
            return Err(Error::NotSupported(format!("{REMOVE_PREFIX}{event}")));
        }
        self.connection.remove_handler(event, handler).await?;
        Ok(Reply::Empty)
    }

    /// Call `method` and decode its result.
    ///
    /// # Errors
    ///
    /// As [`Proxy::invoke`], or if the result does not decode as `R`.
    pub async fn call<A: Parameters, R: DeserializeOwned>(
        &self,
        method: &str,
        args: A,
    ) -> Result<R> {
        self.invoke(method, Arguments::Values(args.to_values()?))
            .await?
            .decode()
    }

    /// Call a method that returns nothing.
    ///
    /// # Errors
    ///
    /// As [`Proxy::invoke`].
    pub async fn call_void<A: Parameters>(&self, method: &str, args: A) -> Result<()> {
        self.invoke(method, Arguments::Values(args.to_values()?))
            .await
            .map(drop)
    }

    /// Call a method returning a hosted object and connect to it.
    ///
    /// # Errors
    ///
    /// [`Error::NotHostedResult`] when the server returned a copy instead.
    pub async fn call_object<A: Parameters>(
        &self,
        method: &str,
        args: A,
        contract: Arc<ContractDescription>,
    ) -> Result<Self> {
        match self.invoke(method, Arguments::Values(args.to_values()?)).await? {
            Reply::Object(object_id) => {
                let connection = self
                    .connection
                    .session()
                    .connect_object(&object_id, contract)
                    .await?;
                Ok(Self::new(connection))
            }
            Reply::Value(_) | Reply::Empty => Err(Error::NotHostedResult(method.to_string())),
        }
    }

    /// Read `property`.
    ///
    /// # Errors
    ///
    /// As [`Proxy::call`].
    pub async fn get<R: DeserializeOwned>(&self, property: &str) -> Result<R> {
        self.invoke(&format!("{GETTER_PREFIX}{property}"), Arguments::Values(Vec::new()))
            .await?
            .decode()
    }

    /// Write `property`. Failures of one-way properties are logged, not returned.
    ///
    /// # Errors
    ///
    /// As [`Proxy::invoke`].
    pub async fn set<V: Serialize + ?Sized>(&self, property: &str, value: &V) -> Result<()> {
        let value = to_value(value)?;
        self.invoke(&format!("{SETTER_PREFIX}{property}"), Arguments::Values(vec![value]))
            .await
            .map(drop)
    }

    /// Attach `handler` to `event`. Returns the handle [`Proxy::unsubscribe`] takes.
    ///
    /// # Errors
    ///
    /// Fails when the server refuses the subscription; the handler is then not kept.
    pub async fn subscribe<F>(&self, event: &str, handler: F) -> Result<EventHandler>
    where
        F: Fn(&EventNotification) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.invoke(&format!("{ADD_PREFIX}{event}"), Arguments::Handler(handler.clone()))
            .await?;
        Ok(handler)
    }

    /// Detach a handler returned by [`Proxy::subscribe`].
    ///
    /// # Errors
    ///
    /// As [`Proxy::invoke`].
    pub async fn unsubscribe(&self, event: &str, handler: &EventHandler) -> Result<()> {
        self.invoke(&format!("{REMOVE_PREFIX}{event}"), Arguments::Handler(handler.clone()))
            .await
            .map(drop)
    }

    /// Close the connection.
    pub async fn dispose(&self) {
        self.connection.dispose().await;
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("object_id", &self.object_id())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}
