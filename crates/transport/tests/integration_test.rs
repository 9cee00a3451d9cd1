//! Integration tests for transport bindings

use std::time::Duration;

use eloquent_transport::{Binding, MemoryBinding, TcpBinding, binding_for};
use eloquent_wire::{HostAddress, Scheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

async fn echo_roundtrip(binding: &dyn Binding, listen_on: HostAddress) {
    let listener = binding.listen(&listen_on).await.expect("Failed to listen");
    let address = listener.local_address().clone();

    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            let mut conn = listener.accept().await.expect("Failed to accept");
            tokio::spawn(async move {
                let mut buf = [0u8; 5];
                while conn.read_exact(&mut buf).await.is_ok() {
                    if conn.write_all(&buf).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    for _ in 0..2 {
        let mut client = binding.connect(&address).await.expect("Failed to connect");
        for msg in [b"hello", b"world"] {
            client.write_all(msg).await.unwrap();
            let mut buf = [0u8; 5];
            timeout(Duration::from_secs(1), client.read_exact(&mut buf))
                .await
                .expect("Timeout")
                .unwrap();
            assert_eq!(&buf, msg);
        }
    }

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_memory_multiple_clients() {
    let _ = tracing_subscriber::fmt::try_init();
    echo_roundtrip(&MemoryBinding::new(), HostAddress::new("it-memory", 0)).await;
}

#[tokio::test]
async fn test_tcp_multiple_clients() {
    let _ = tracing_subscriber::fmt::try_init();
    echo_roundtrip(&TcpBinding::new(), HostAddress::new("127.0.0.1", 0)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_pipe_multiple_clients() {
    let _ = tracing_subscriber::fmt::try_init();
    let binding = binding_for(Scheme::Pipe);
    echo_roundtrip(binding.as_ref(), HostAddress::new("it-pipe", 0)).await;
}
