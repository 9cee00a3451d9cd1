//! Bidirectional object RPC.
//!
//! A [`Server`] hosts plain Rust objects under string ids. Each hosted type is
//! described by a [`HostedContract`]: which methods, properties and events are
//! reachable and how to invoke them. Clients open a [`SessionAgent`] to the server,
//! connect to objects by id and talk to them through a [`Proxy`], which turns
//! member access into calls, one-way notifications and event subscriptions.
//!
//! ```ignore
//! let contract = HostedContract::<Calculator>::builder("Calculator")
//!     .method("Add", |calc: &Calculator, (a, b): (i32, i32)| Ok(calc.add(a, b)))
//!     .build()?;
//! let server = Server::bind("tcp://127.0.0.1:0", Settings::default()).await?;
//! let _registration = server.host("calc", Arc::new(Calculator::default()), contract.clone())?;
//!
//! let server_uri = server.endpoint().to_string();
//! let agent = SessionAgent::connect("tcp://127.0.0.1:0", &server_uri, Settings::default()).await?;
//! let calc = agent.proxy("calc", contract.description().clone()).await?;
//! let sum: i32 = calc.call("Add", (2, 3)).await?;
//! ```
//!
//! Events flow the other way: the server connects back to the address the agent
//! listens on and delivers every raise of a subscribed [`Event`] there.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
mod channel;
pub mod client;
pub mod context;
pub mod contract;
pub mod error;
pub mod event;
pub mod hosted;
pub mod proxy;
pub mod repository;
pub mod serializer;
pub mod server;
pub mod settings;

pub use adapter::{CallReply, ObjectAdapter, SubscriberKey};
pub use client::{ConnectionAgent, Reply, SessionAgent, SessionAgentBuilder};
pub use context::ExecutionContext;
pub use contract::{
    ContractBuilder, ContractDescription, EventDescription, EventShape, MethodDescription,
    PropertyAccess, PropertyDescription,
};
pub use error::{CodecError, ContractError, Error, Result};
pub use event::{Event, HandlerId};
pub use hosted::{HostedContract, HostedContractBuilder};
pub use proxy::{Arguments, EventHandler, EventNotification, Proxy};
pub use repository::{ObjectsRepository, Registration};
pub use serializer::{CallInfo, CborSerializer, ObjectRef, Parameters, Serializer, Value};
pub use server::{Server, ServerBuilder};
pub use settings::Settings;

// Re-export the wire types that appear in our public API
pub use eloquent_wire::{Endpoint, ErrorKind, Fault, HostAddress, Scheme};
