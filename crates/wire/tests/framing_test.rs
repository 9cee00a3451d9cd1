//! Integration tests for frame encoding over a byte stream.

use eloquent_wire::{
    EndpointKind, EndpointMessage, Frame, FrameBuilder, FrameCodec, FrameError, HostAddress,
    SessionBody, SessionMessage,
};
use futures::{SinkExt, StreamExt};
use proptest::prelude::*;
use tokio_util::codec::{FramedRead, FramedWrite};

#[derive(Debug, Clone)]
enum Field {
    Byte(u8),
    Bool(bool),
    Int(i32),
    Text(String),
    Buffer(Vec<u8>),
}

fn field() -> impl Strategy<Value = Field> {
    prop_oneof![
        any::<u8>().prop_map(Field::Byte),
        any::<bool>().prop_map(Field::Bool),
        any::<i32>().prop_map(Field::Int),
        ".{0,24}".prop_map(Field::Text),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(Field::Buffer),
    ]
}

fn take(frame: &mut Frame, expected: &Field) -> Result<(), FrameError> {
    match expected {
        Field::Byte(v) => assert_eq!(frame.take_byte()?, *v),
        Field::Bool(v) => assert_eq!(frame.take_bool()?, *v),
        Field::Int(v) => assert_eq!(frame.take_i32()?, *v),
        Field::Text(v) => assert_eq!(&frame.take_string()?, v),
        Field::Buffer(v) => assert_eq!(frame.take_buffer()?.as_ref(), v.as_slice()),
    }
    Ok(())
}

proptest! {
    #[test]
    fn takes_mirror_writes(fields in proptest::collection::vec(field(), 0..16)) {
        let mut builder = FrameBuilder::new();
        for f in &fields {
            match f {
                Field::Byte(v) => { builder.write_byte(*v); }
                Field::Bool(v) => { builder.write_bool(*v); }
                Field::Int(v) => { builder.write_i32(*v); }
                Field::Text(v) => { builder.write_string(v); }
                Field::Buffer(v) => { builder.write_buffer(v); }
            }
        }
        let mut frame = builder.into_frame();
        for f in &fields {
            take(&mut frame, f).unwrap();
        }
        prop_assert!(frame.is_exhausted());
        prop_assert!(
            matches!(frame.take_byte(), Err(FrameError::EndOfFrame { .. })),
            "reading past the end must fail"
        );
    }
}

#[tokio::test]
async fn test_call_pair_arrives_back_to_back() {
    let (client, server) = tokio::io::duplex(4096);
    let mut writer = FramedWrite::new(client, FrameCodec::new());
    let mut reader = FramedRead::new(server, FrameCodec::new());

    let sender = HostAddress::new("127.0.0.1", 7000);
    let marker = SessionMessage::new(sender.clone(), SessionBody::Request);
    let request = EndpointMessage::new(
        EndpointKind::Request,
        "calculator",
        1,
        eloquent_wire::Bytes::from_static(b"payload"),
    );

    writer.feed(marker.to_frame()).await.unwrap();
    writer.feed(request.to_frame()).await.unwrap();
    writer.flush().await.unwrap();

    let first = reader.next().await.unwrap().unwrap();
    let second = reader.next().await.unwrap().unwrap();

    assert_eq!(SessionMessage::from_frame(first).unwrap(), marker);
    assert_eq!(EndpointMessage::from_frame(second).unwrap(), request);
}

#[tokio::test]
async fn test_truncated_stream_reports_error() {
    let (client, server) = tokio::io::duplex(64);
    let mut reader = FramedRead::new(server, FrameCodec::new());

    {
        use tokio::io::AsyncWriteExt;
        let mut client = client;
        client.write_all(&10_i32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
    }

    let result = reader.next().await.unwrap();
    assert!(matches!(result, Err(FrameError::Io(_))));
}
