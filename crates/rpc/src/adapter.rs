//! Per-object adapter: dispatches calls into a hosted instance and fans its
//! events out to remote subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use eloquent_wire::{ErrorKind, Fault, HostAddress};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::contract::{ContractDescription, EventShape};
use crate::event::HandlerId;
use crate::hosted::{EventSink, HostedContract, Outcome};
use crate::repository::ObjectsRepository;
use crate::serializer::{CallInfo, Value, referenced_objects};

/// Identifies one remote subscriber: a client session plus its logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    /// Client the events are delivered to.
    pub client: HostAddress,
    /// Connection that subscribed.
    pub connection_id: i32,
}

/// Delivers one event occurrence to one subscriber.
pub type Deliver = Arc<dyn Fn(CallInfo) + Send + Sync>;

struct Subscriber {
    key: SubscriberKey,
    deliver: Deliver,
}

type Subscribers = Arc<RwLock<HashMap<String, Vec<Subscriber>>>>;

/// Result of serving a two-way call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    /// Serialized return value.
    Value(Value),
    /// The returned object is hosted under this id.
    Object(String),
    /// The operation failed.
    Fault(Fault),
    /// No operation with the requested name and arity.
    OperationNotFound(String),
    /// A parameter references an object that is not hosted.
    ObjectNotFound(String),
}

trait Dispatch: Send + Sync {
    fn description(&self) -> &Arc<ContractDescription>;
    fn invoke(&self, name: &str, parameters: &[Value]) -> Option<Result<Outcome, Fault>>;
    fn instance(&self) -> Arc<dyn Any + Send + Sync>;
    fn identity(&self) -> usize;
    fn attach(&self, event: &str, sink: EventSink) -> Option<HandlerId>;
    fn detach(&self, event: &str, id: HandlerId);
}

struct Hosted<T> {
    instance: Arc<T>,
    contract: Arc<HostedContract<T>>,
}

impl<T: Send + Sync + 'static> Dispatch for Hosted<T> {
    fn description(&self) -> &Arc<ContractDescription> {
        self.contract.description()
    }

    fn invoke(&self, name: &str, parameters: &[Value]) -> Option<Result<Outcome, Fault>> {
        self.contract.invoke(&self.instance, name, parameters)
    }

    fn instance(&self) -> Arc<dyn Any + Send + Sync> {
        self.instance.clone()
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.instance).cast::<()>() as usize
    }

    fn attach(&self, event: &str, sink: EventSink) -> Option<HandlerId> {
        self.contract.attach(&self.instance, event, sink)
    }

    fn detach(&self, event: &str, id: HandlerId) {
        self.contract.detach(&self.instance, event, id);
    }
}

/// Adapter between the wire and one hosted instance.
///
/// Created when an object is hosted; dropping it detaches every event binding.
pub struct ObjectAdapter {
    object_id: String,
    target: Arc<dyn Dispatch>,
    context: Option<ExecutionContext>,
    subscribers: Subscribers,
    bindings: Vec<(String, HandlerId)>,
}

impl ObjectAdapter {
    /// Wrap `instance`, binding every event of `contract` to the subscriber list.
    ///
    /// With a `context`, every invocation runs on that context's thread.
    pub fn new<T: Send + Sync + 'static>(
        object_id: impl Into<String>,
        instance: Arc<T>,
        contract: Arc<HostedContract<T>>,
        context: Option<ExecutionContext>,
    ) -> Self {
        let object_id = object_id.into();
        let target: Arc<dyn Dispatch> = Arc::new(Hosted { instance, contract });
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));

        let events = target.description().events().to_vec();
        let mut bindings = Vec::with_capacity(events.len());
        for event in events {
            let sink = forwarder(event.name.clone(), event.shape, subscribers.clone());
            match target.attach(&event.name, sink) {
                Some(id) => bindings.push((event.name, id)),
                None => warn!("Event {} of {} has no binding", event.name, object_id),
            }
        }

        Self {
            object_id,
            target,
            context,
            subscribers,
            bindings,
        }
    }

    /// Id the object is hosted under.
    #[must_use]
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Contract of the hosted instance.
    #[must_use]
    pub fn description(&self) -> &Arc<ContractDescription> {
        self.target.description()
    }

    /// The hosted instance.
    #[must_use]
    pub fn instance(&self) -> Arc<dyn Any + Send + Sync> {
        self.target.instance()
    }

    /// Address of the hosted instance, for identity comparison.
    #[must_use]
    pub fn identity(&self) -> usize {
        self.target.identity()
    }

    /// Start delivering `event` to `key`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::EventNotFound`] if the contract has no such event,
    /// [`ErrorKind::EventAlreadySubscribed`] if `key` already subscribed.
    pub fn subscribe(
        &self,
        event: &str,
        key: SubscriberKey,
        deliver: Deliver,
    ) -> Result<(), ErrorKind> {
        if self.description().event(event).is_none() {
            return Err(ErrorKind::EventNotFound);
        }

        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(event.to_string()).or_default();
        if list.iter().any(|subscriber| subscriber.key == key) {
            return Err(ErrorKind::EventAlreadySubscribed);
        }
        debug!(
            "{}:{} subscribed to {}.{}",
            key.client, key.connection_id, self.object_id, event
        );
        list.push(Subscriber { key, deliver });
        Ok(())
    }

    /// Stop delivering `event` to `key`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, event: &str, key: &SubscriberKey) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.key != *key);
        list.len() != before
    }

    /// Drop every subscription of `client`, or only those of one connection.
    pub fn unsubscribe_client(&self, client: &HostAddress, connection_id: Option<i32>) {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            list.retain(|subscriber| {
                subscriber.key.client != *client
                    || connection_id.is_some_and(|id| id != subscriber.key.connection_id)
            });
        }
    }

    /// Number of subscribers of `event`.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.read().get(event).map_or(0, Vec::len)
    }

    /// Serve a two-way call.
    ///
    /// Parameters are checked: every [`ObjectRef`](crate::ObjectRef) must name a
    /// hosted object. Failures of one-way operations are logged, never returned.
    pub async fn handle_call(&self, call: CallInfo, repository: &ObjectsRepository) -> CallReply {
        let arity = call.parameters.len();
        let Some(operation) = self.description().operation(&call.operation_name, arity) else {
            return CallReply::OperationNotFound(format!("{}/{}", call.operation_name, arity));
        };

        if let Some(missing) = referenced_objects(&call.parameters)
            .into_iter()
            .find(|id| !repository.contains(id))
        {
            return CallReply::ObjectNotFound(missing.to_string());
        }

        match self.invoke(call).await {
            None => CallReply::OperationNotFound(format!("{}/{}", operation.name, arity)),
            Some(Ok(Outcome::Value(value))) => CallReply::Value(value),
            Some(Ok(Outcome::Object { instance, copy })) => repository
                .try_get_object_id(&instance)
                .map_or(CallReply::Value(copy), CallReply::Object),
            Some(Err(fault)) if operation.one_way => {
                debug!("One-way {} on {} failed: {}", operation.name, self.object_id, fault);
                CallReply::Value(Value::Null)
            }
            Some(Err(fault)) => CallReply::Fault(fault),
        }
    }

    /// Serve a one-way call. Parameters are not checked; failures are logged.
    pub async fn handle_notification(&self, call: CallInfo) {
        let name = call.operation_name.clone();
        match self.invoke(call).await {
            None => warn!(
                "Notification for unknown operation {} on {}",
                name, self.object_id
            ),
            Some(Err(fault)) => {
                debug!("Notification {} on {} failed: {}", name, self.object_id, fault);
            }
            Some(Ok(_)) => {}
        }
    }

    async fn invoke(&self, call: CallInfo) -> Option<Result<Outcome, Fault>> {
        let target = self.target.clone();
        let job = move || {
            catch_unwind(AssertUnwindSafe(|| {
                target.invoke(&call.operation_name, &call.parameters)
            }))
            .unwrap_or_else(|panic| Some(Err(panic_fault(panic.as_ref()))))
        };

        match &self.context {
            Some(context) => context
                .run(job)
                .await
                .unwrap_or_else(|e| Some(Err(Fault::from_error(&e)))),
            None => job(),
        }
    }
}

impl Drop for ObjectAdapter {
    fn drop(&mut self) {
        for (event, id) in self.bindings.drain(..) {
            self.target.detach(&event, id);
        }
        self.subscribers.write().clear();
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("object_id", &self.object_id)
            .field("contract", &self.description().name())
            .finish_non_exhaustive()
    }
}

/// Sink bound to one event: snapshots the subscribers and hands each its own copy.
fn forwarder(name: String, shape: EventShape, subscribers: Subscribers) -> EventSink {
    Arc::new(move |arguments: Vec<Value>| {
        let parameters = match shape {
            EventShape::Plain => arguments,
            EventShape::Standard => std::iter::once(Value::Null).chain(arguments).collect(),
        };
        let targets: Vec<Deliver> = subscribers
            .read()
            .get(&name)
            .map(|list| list.iter().map(|subscriber| subscriber.deliver.clone()).collect())
            .unwrap_or_default();
        for deliver in targets {
            deliver(CallInfo::new(name.clone(), parameters.clone()));
        }
    })
}

fn panic_fault(payload: &(dyn Any + Send)) -> Fault {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_string());
    Fault::new("panic", message)
}
