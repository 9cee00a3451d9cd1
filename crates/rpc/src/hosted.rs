//! Typed dispatch tables binding a contract to a Rust type.
//!
//! A [`HostedContract<T>`] pairs a [`ContractDescription`] with the handlers that
//! serve it on a `T`. Handlers decode their parameters through [`Parameters`] and
//! report failures as [`Fault`]s, which is exactly what travels back to the caller.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use eloquent_wire::Fault;
use serde::Serialize;
use tracing::warn;

use crate::contract::{
    ContractBuilder, ContractDescription, EventShape, GETTER_PREFIX, PropertyAccess, SETTER_PREFIX,
};
use crate::error::ContractError;
use crate::event::{Event, HandlerId};
use crate::serializer::{Parameters, Value, to_value};

/// What a hosted operation produced.
pub enum Outcome {
    /// A plain value.
    Value(Value),
    /// An object; sent as a reference when it is hosted, otherwise as `copy`.
    Object {
        /// The returned instance, compared by identity against hosted objects.
        instance: Arc<dyn Any + Send + Sync>,
        /// Serialized copy used when the instance is not hosted.
        copy: Value,
    },
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Object { copy, .. } => f.debug_struct("Object").field("copy", copy).finish(),
        }
    }
}

/// Receives the encoded arguments of every raise of one bound event.
pub type EventSink = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

type Invoker<T> = Arc<dyn Fn(&T, &[Value]) -> Result<Outcome, Fault> + Send + Sync>;
type Attach<T> = Arc<dyn Fn(&T, EventSink) -> HandlerId + Send + Sync>;
type Detach<T> = Arc<dyn Fn(&T, HandlerId) + Send + Sync>;

struct EventBinding<T> {
    attach: Attach<T>,
    detach: Detach<T>,
}

/// A contract plus the handlers serving it on `T`.
pub struct HostedContract<T> {
    description: Arc<ContractDescription>,
    operations: HashMap<(String, usize), Invoker<T>>,
    events: HashMap<String, EventBinding<T>>,
}

impl<T: Send + Sync + 'static> HostedContract<T> {
    /// Start a contract named `name`.
    pub fn builder(name: impl Into<String>) -> HostedContractBuilder<T> {
        HostedContractBuilder {
            description: ContractDescription::builder(name),
            properties: Vec::new(),
            operations: Vec::new(),
            events: Vec::new(),
        }
    }

    /// The contract served.
    #[must_use]
    pub const fn description(&self) -> &Arc<ContractDescription> {
        &self.description
    }

    /// Run an operation. `None` when no handler has that name and arity.
    pub(crate) fn invoke(
        &self,
        target: &T,
        name: &str,
        parameters: &[Value],
    ) -> Option<Result<Outcome, Fault>> {
        self.operations
            .get(&(name.to_string(), parameters.len()))
            .map(|invoker| invoker(target, parameters))
    }

    /// Attach `sink` to the event `name` of `target`.
    pub(crate) fn attach(&self, target: &T, name: &str, sink: EventSink) -> Option<HandlerId> {
        self.events
            .get(name)
            .map(|binding| (binding.attach)(target, sink))
    }

    /// Undo [`Self::attach`].
    pub(crate) fn detach(&self, target: &T, name: &str, id: HandlerId) {
        if let Some(binding) = self.events.get(name) {
            (binding.detach)(target, id);
        }
    }
}

impl<T> fmt::Debug for HostedContract<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedContract")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

struct PropertyEntry {
    name: String,
    readable: bool,
    writable: bool,
    one_way: bool,
}

/// Builder for [`HostedContract`].
pub struct HostedContractBuilder<T> {
    description: ContractBuilder,
    properties: Vec<PropertyEntry>,
    operations: Vec<((String, usize), Invoker<T>)>,
    events: Vec<(String, EventBinding<T>)>,
}

fn fault_from<E: std::error::Error>(error: &E) -> Fault {
    Fault::from_error(error)
}

impl<T: Send + Sync + 'static> HostedContractBuilder<T> {
    /// Two-way method returning a value.
    #[must_use]
    pub fn method<A, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: Parameters,
        R: Serialize + 'static,
        F: Fn(&T, A) -> Result<R, Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        self.description = self
            .description
            .with_method(name.clone(), A::ARITY, false, true);
        self.operation(name, A::ARITY, value_invoker(handler))
    }

    /// Two-way method returning nothing.
    #[must_use]
    pub fn void_method<A, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: Parameters,
        F: Fn(&T, A) -> Result<(), Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        self.description = self
            .description
            .with_method(name.clone(), A::ARITY, false, false);
        self.operation(name, A::ARITY, value_invoker(handler))
    }

    /// Fire-and-forget method; its failures never reach the caller.
    #[must_use]
    pub fn one_way_method<A, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: Parameters,
        F: Fn(&T, A) -> Result<(), Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        self.description = self
            .description
            .with_method(name.clone(), A::ARITY, true, false);
        self.operation(name, A::ARITY, value_invoker(handler))
    }

    /// Two-way method returning an object.
    ///
    /// When the returned instance is hosted on the same server the caller receives a
    /// reference it can connect to, otherwise a serialized copy.
    #[must_use]
    pub fn object_method<A, U, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: Parameters,
        U: Serialize + Send + Sync + 'static,
        F: Fn(&T, A) -> Result<Arc<U>, Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        self.description = self
            .description
            .with_method(name.clone(), A::ARITY, false, true);
        let invoker: Invoker<T> = Arc::new(move |target: &T, parameters: &[Value]| {
            let args = A::from_values(parameters).map_err(|e| fault_from(&e))?;
            let instance = handler(target, args)?;
            let copy = to_value(instance.as_ref()).map_err(|e| fault_from(&e))?;
            Ok(Outcome::Object {
                instance: instance as Arc<dyn Any + Send + Sync>,
                copy,
            })
        });
        self.operation(name, A::ARITY, invoker)
    }

    /// Property getter, served as `get_<name>`.
    #[must_use]
    pub fn property_get<R, F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn(&T) -> Result<R, Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        self.property_entry(&name).readable = true;
        self.operation(
            format!("{GETTER_PREFIX}{name}"),
            0,
            value_invoker(move |target: &T, (): ()| getter(target)),
        )
    }

    /// Property setter, served as `set_<name>`.
    #[must_use]
    pub fn property_set<V, F>(self, name: impl Into<String>, setter: F) -> Self
    where
        V: serde::de::DeserializeOwned + Serialize + Send + 'static,
        F: Fn(&T, V) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.setter(name.into(), false, setter)
    }

    /// Property setter whose failures never reach the caller.
    #[must_use]
    pub fn one_way_property_set<V, F>(self, name: impl Into<String>, setter: F) -> Self
    where
        V: serde::de::DeserializeOwned + Serialize + Send + 'static,
        F: Fn(&T, V) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.setter(name.into(), true, setter)
    }

    /// Bind the event `name` to the [`Event`] returned by `accessor`.
    #[must_use]
    pub fn event<A, F>(mut self, name: impl Into<String>, shape: EventShape, accessor: F) -> Self
    where
        A: Parameters,
        F: Fn(&T) -> &Event<A> + Send + Sync + 'static,
    {
        let name = name.into();
        self.description = self.description.event(name.clone(), shape);

        let accessor = Arc::new(accessor);
        let attach_accessor = accessor.clone();
        let event_name = name.clone();
        let attach: Attach<T> = Arc::new(move |target: &T, sink: EventSink| {
            let event_name = event_name.clone();
            attach_accessor(target).subscribe(move |args: &A| match args.to_values() {
                Ok(values) => sink(values),
                Err(e) => warn!("Dropping raise of {}: {}", event_name, e),
            })
        });
        let detach: Detach<T> = Arc::new(move |target: &T, id| {
            accessor(target).unsubscribe(id);
        });

        self.events.push((name, EventBinding { attach, detach }));
        self
    }

    /// Validate and seal the contract.
    ///
    /// # Errors
    ///
    /// Fails on duplicate members, as [`ContractBuilder::build`].
    pub fn build(self) -> Result<Arc<HostedContract<T>>, ContractError> {
        let mut description = self.description;
        for property in self.properties {
            let access = match (property.readable, property.writable) {
                (true, true) => PropertyAccess::ReadWrite,
                (false, true) => PropertyAccess::WriteOnly,
                _ => PropertyAccess::ReadOnly,
            };
            description = description.with_property(property.name, access, property.one_way);
        }
        let description = Arc::new(description.build()?);

        let mut events = HashMap::new();
        for (name, binding) in self.events {
            events.insert(name, binding);
        }

        Ok(Arc::new(HostedContract {
            description,
            operations: self.operations.into_iter().collect(),
            events,
        }))
    }

    fn operation(mut self, name: String, arity: usize, invoker: Invoker<T>) -> Self {
        self.operations.push(((name, arity), invoker));
        self
    }

    fn property_entry(&mut self, name: &str) -> &mut PropertyEntry {
        let index = match self.properties.iter().position(|entry| entry.name == name) {
            Some(index) => index,
            None => {
                self.properties.push(PropertyEntry {
                    name: name.to_string(),
                    readable: false,
                    writable: false,
                    one_way: false,
                });
                self.properties.len() - 1
            }
        };
        &mut self.properties[index]
    }

    fn setter<V, F>(mut self, name: String, one_way: bool, setter: F) -> Self
    where
        V: serde::de::DeserializeOwned + Serialize + Send + 'static,
        F: Fn(&T, V) -> Result<(), Fault> + Send + Sync + 'static,
    {
        let entry = self.property_entry(&name);
        entry.writable = true;
        entry.one_way = one_way;
        self.operation(
            format!("{SETTER_PREFIX}{name}"),
            1,
            value_invoker(move |target: &T, (value,): (V,)| setter(target, value)),
        )
    }
}

fn value_invoker<T, A, R, F>(handler: F) -> Invoker<T>
where
    T: 'static,
    A: Parameters,
    R: Serialize + 'static,
    F: Fn(&T, A) -> Result<R, Fault> + Send + Sync + 'static,
{
    Arc::new(move |target: &T, parameters: &[Value]| {
        let args = A::from_values(parameters).map_err(|e| fault_from(&e))?;
        let result = handler(target, args)?;
        to_value(&result)
            .map(Outcome::Value)
            .map_err(|e| fault_from(&e))
    })
}
