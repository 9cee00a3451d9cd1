//! Calls, properties and object references across every transport.

mod common;

use std::time::{Duration, Instant};

use common::{CALCULATOR_ID, DivideByZero, Fixture, MEMORY_ID, Transport};
use eloquent_rpc::{Arguments, Error, ErrorKind, ObjectRef, Reply, Settings, Value};

async fn add_records_history(transport: Transport) {
    let fixture = Fixture::start(transport, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    let sum: i32 = calc.call("Add", (2, 3)).await.unwrap();
    assert_eq!(sum, 5);
    assert_eq!(fixture.calculator.history(), vec!["2 + 3 = 5".to_string()]);

    let history: Vec<String> = calc.call("History", ()).await.unwrap();
    assert_eq!(history, vec!["2 + 3 = 5".to_string()]);

    agent.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_over_memory() {
    let _ = tracing_subscriber::fmt::try_init();
    add_records_history(Transport::Memory).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_over_tcp() {
    let _ = tracing_subscriber::fmt::try_init();
    add_records_history(Transport::Tcp).await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_add_over_pipe() {
    let _ = tracing_subscriber::fmt::try_init();
    add_records_history(Transport::Pipe).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fault_carries_type_and_message() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Memory, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    let result: Result<i32, Error> = calc.call("Divide", (7, 0)).await;
    match result {
        Err(Error::Remote(fault)) => {
            assert_eq!(fault.type_name, std::any::type_name::<DivideByZero>());
            assert_eq!(fault.message, "cannot divide 7 by zero");
        }
        other => panic!("expected a remote fault, got {other:?}"),
    }

    // The session survives a fault
    let quotient: i32 = calc.call("Divide", (8, 2)).await.unwrap();
    assert_eq!(quotient, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_way_failure_neither_raises_nor_blocks() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Tcp, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    let started = Instant::now();
    calc.call_void("Fail", ()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));

    // Served once the slow notification finishes
    let sum: i32 = calc.call("Add", (1, 1)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_properties() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Memory, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    assert_eq!(calc.get::<u32>("Precision").await.unwrap(), 2);
    calc.set("Precision", &6u32).await.unwrap();
    assert_eq!(calc.get::<u32>("Precision").await.unwrap(), 6);

    calc.set("Label", "totals").await.unwrap();
    // A rejected one-way write is swallowed
    calc.set("Label", "").await.unwrap();
    let labelled = || fixture.calculator.label() == "totals";
    assert!(common::eventually(Duration::from_secs(2), labelled).await);

    // Write-only: there is no getter
    assert!(matches!(
        calc.get::<String>("Label").await,
        Err(Error::NotSupported(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_members() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Memory, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    for member in ["raise_ResultReady", "op_Addition", "Multiply", "get_Missing"] {
        assert!(
            matches!(
                calc.invoke(member, Arguments::Values(Vec::new())).await,
                Err(Error::NotSupported(_))
            ),
            "{member} should be refused"
        );
    }

    // Right name, wrong arity
    assert!(matches!(
        calc.call::<_, i32>("Add", (1,)).await,
        Err(Error::NotSupported(_))
    ));

    // Bypassing the proxy reaches the server's own check
    let reply = calc
        .connection()
        .call("Add", vec![Value::from(1)])
        .await;
    assert!(matches!(
        reply,
        Err(Error::Protocol { kind: ErrorKind::OperationNotFound, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_object_reference_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Tcp, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    // A hosted result comes back as a reference the client can connect to
    let memory = calc
        .call_object("Memory", (), fixture.register_contract.clone())
        .await
        .unwrap();
    assert_eq!(memory.object_id(), MEMORY_ID);
    assert_ne!(memory.connection_id(), calc.connection_id());

    memory.set("Value", &42i64).await.unwrap();
    assert_eq!(fixture.memory.get(), 42);

    // And a reference passed back resolves to the same instance
    let recalled: i64 = calc.call("Recall", (memory.object_ref(),)).await.unwrap();
    assert_eq!(recalled, 42);

    let missing: Result<i64, Error> = calc.call("Recall", (ObjectRef::new("nowhere"),)).await;
    assert!(matches!(
        missing,
        Err(Error::Protocol {
            kind: ErrorKind::ObjectNotFound,
            ref message,
        }) if message == "nowhere"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unhosted_result_is_a_copy() {
    let _ = tracing_subscriber::fmt::try_init();
    let fixture = Fixture::start(Transport::Memory, Settings::default()).await;
    fixture.memory.set(9);
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    let reply = calc
        .invoke("Snapshot", Arguments::Values(Vec::new()))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Value(Value::from(9)));

    assert!(matches!(
        calc.call_object("Snapshot", (), fixture.register_contract.clone())
            .await,
        Err(Error::NotHostedResult(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calls_after_unhosting() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut fixture = Fixture::start(Transport::Memory, Settings::default()).await;
    let agent = fixture.agent(Settings::default()).await;
    let calc = agent
        .proxy(CALCULATOR_ID, fixture.calculator_contract.clone())
        .await
        .unwrap();

    fixture.unhost_calculator();

    assert!(matches!(
        calc.call::<_, i32>("Add", (1, 2)).await,
        Err(Error::Protocol { kind: ErrorKind::ObjectNotFound, .. })
    ));
    assert!(matches!(
        agent
            .connect_object(CALCULATOR_ID, fixture.calculator_contract.clone())
            .await,
        Err(Error::ObjectNotHosted(id)) if id == CALCULATOR_ID
    ));
}
