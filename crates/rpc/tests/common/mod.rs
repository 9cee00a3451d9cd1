//! Shared fixtures for the end-to-end suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use eloquent_rpc::{
    ContractDescription, Event, EventShape, Fault, HostedContract, ObjectRef, ObjectsRepository,
    Registration, Server, SessionAgent, Settings,
};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};

pub const CALCULATOR_ID: &str = "calc";
pub const MEMORY_ID: &str = "memory";

/// Transports every scenario runs over.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Memory,
    Tcp,
    #[cfg(unix)]
    Pipe,
}

impl Transport {
    pub fn uri(self) -> &'static str {
        match self {
            Self::Memory => "memory://127.0.0.1:0",
            Self::Tcp => "tcp://127.0.0.1:0",
            #[cfg(unix)]
            Self::Pipe => "pipe://127.0.0.1:0",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot divide {0} by zero")]
pub struct DivideByZero(pub i32);

#[derive(Debug, thiserror::Error)]
#[error("label must not be empty")]
pub struct EmptyLabel;

/// A value cell hosted next to the calculator and handed out by reference.
#[derive(Debug, Default)]
pub struct Register {
    value: AtomicI64,
}

impl Register {
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }
}

impl Serialize for Register {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.get())
    }
}

pub struct Calculator {
    history: Mutex<Vec<String>>,
    precision: AtomicU32,
    label: Mutex<String>,
    memory: Arc<Register>,
    repository: ObjectsRepository,
    pub result_ready: Event<(i32,)>,
    pub cleared: Event<()>,
}

impl Calculator {
    pub fn new(memory: Arc<Register>, repository: ObjectsRepository) -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            precision: AtomicU32::new(2),
            label: Mutex::new(String::new()),
            memory,
            repository,
            result_ready: Event::new(),
            cleared: Event::new(),
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    pub fn label(&self) -> String {
        self.label.lock().clone()
    }

    fn add(&self, a: i32, b: i32) -> i32 {
        let sum = a + b;
        self.history.lock().push(format!("{a} + {b} = {sum}"));
        self.result_ready.raise(&(sum,));
        sum
    }
}

pub fn calculator_contract() -> Arc<HostedContract<Calculator>> {
    HostedContract::<Calculator>::builder("Calculator")
        .method("Add", |calc: &Calculator, (a, b): (i32, i32)| Ok(calc.add(a, b)))
        .method("Divide", |_: &Calculator, (a, b): (i32, i32)| {
            if b == 0 {
                Err(Fault::from_error(&DivideByZero(a)))
            } else {
                Ok(a / b)
            }
        })
        .method("History", |calc: &Calculator, (): ()| Ok(calc.history()))
        .void_method("Clear", |calc: &Calculator, (): ()| {
            calc.history.lock().clear();
            calc.cleared.raise(&());
            Ok(())
        })
        .one_way_method("Fail", |_: &Calculator, (): ()| {
            std::thread::sleep(Duration::from_millis(500));
            Err(Fault::new("Overflow", "one-way operation failed"))
        })
        .object_method("Memory", |calc: &Calculator, (): ()| Ok(calc.memory.clone()))
        .object_method("Snapshot", |calc: &Calculator, (): ()| {
            let copy = Register::default();
            copy.set(calc.memory.get());
            Ok(Arc::new(copy))
        })
        .method("Recall", |calc: &Calculator, (reference,): (ObjectRef,)| {
            calc.repository
                .resolve::<Register>(&reference)
                .map(|register| register.get())
                .ok_or_else(|| Fault::new("NotARegister", reference.object_id))
        })
        .property_get("Precision", |calc: &Calculator| {
            Ok(calc.precision.load(Ordering::SeqCst))
        })
        .property_set("Precision", |calc: &Calculator, precision: u32| {
            calc.precision.store(precision, Ordering::SeqCst);
            Ok(())
        })
        .one_way_property_set("Label", |calc: &Calculator, label: String| {
            if label.is_empty() {
                return Err(Fault::from_error(&EmptyLabel));
            }
            *calc.label.lock() = label;
            Ok(())
        })
        .event("ResultReady", EventShape::Standard, |calc: &Calculator| {
            &calc.result_ready
        })
        .event("Cleared", EventShape::Plain, |calc: &Calculator| &calc.cleared)
        .build()
        .unwrap()
}

pub fn register_contract() -> Arc<HostedContract<Register>> {
    HostedContract::<Register>::builder("Register")
        .property_get("Value", |register: &Register| Ok(register.get()))
        .property_set("Value", |register: &Register, value: i64| {
            register.set(value);
            Ok(())
        })
        .build()
        .unwrap()
}

/// A server hosting a calculator under [`CALCULATOR_ID`] and its register under
/// [`MEMORY_ID`].
pub struct Fixture {
    pub server: Server,
    pub calculator: Arc<Calculator>,
    pub memory: Arc<Register>,
    pub calculator_contract: Arc<ContractDescription>,
    pub register_contract: Arc<ContractDescription>,
    registrations: Vec<Registration>,
}

impl Fixture {
    pub async fn start(transport: Transport, settings: Settings) -> Self {
        let server = Server::bind(transport.uri(), settings).await.unwrap();

        let memory = Arc::new(Register::default());
        let calculator = Arc::new(Calculator::new(
            memory.clone(),
            server.repository().clone(),
        ));
        let calculator_hosted = calculator_contract();
        let register_hosted = register_contract();

        let registrations = vec![
            server
                .host(CALCULATOR_ID, calculator.clone(), calculator_hosted.clone())
                .unwrap(),
            server
                .host(MEMORY_ID, memory.clone(), register_hosted.clone())
                .unwrap(),
        ];

        Self {
            server,
            calculator,
            memory,
            calculator_contract: calculator_hosted.description().clone(),
            register_contract: register_hosted.description().clone(),
            registrations,
        }
    }

    /// Connect a new client over the same transport.
    pub async fn agent(&self, settings: Settings) -> SessionAgent {
        let client_uri = format!("{}://127.0.0.1:0", self.server.endpoint().scheme);
        SessionAgent::connect(
            &client_uri,
            &self.server.endpoint().to_string(),
            settings,
        )
        .await
        .unwrap()
    }

    /// Unhost the calculator.
    pub fn unhost_calculator(&mut self) {
        self.registrations
            .retain(|registration| registration.object_id() != CALCULATOR_ID);
    }
}

/// Poll `condition` every 10 ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
