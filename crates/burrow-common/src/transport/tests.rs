use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use burrow_protocol::{Frame, FrameCodec};

use super::channel::CHANNEL_WINDOW;
use super::handshake::{read_frame, write_frame};
use super::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn addr() -> SocketAddr {
    "127.0.0.1:7835".parse().unwrap()
}

async fn pair(policy: AccessPolicy, token: &str) -> ((Connection, Incoming), (Connection, Incoming)) {
    let (client_io, broker_io) = tokio::io::duplex(256 * 1024);
    let broker = tokio::spawn(async move { accept(broker_io, addr(), &policy, TIMEOUT).await });
    let client = connect(client_io, addr(), token, TIMEOUT).await.unwrap();
    let broker = broker.await.unwrap().unwrap();
    (client, broker)
}

#[tokio::test]
async fn test_handshake_with_valid_token() {
    let ((client, _), (broker, _)) = pair(AccessPolicy::Token("s3cret".into()), "s3cret").await;
    assert_eq!(client.role(), Role::Client);
    assert_eq!(broker.role(), Role::Broker);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_handshake_with_wrong_token() {
    let (client_io, broker_io) = tokio::io::duplex(64 * 1024);
    let policy = AccessPolicy::Token("s3cret".into());
    let broker = tokio::spawn(async move { accept(broker_io, addr(), &policy, TIMEOUT).await });

    let err = connect(client_io, addr(), "wrong", TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TransportError::AuthRejected(ref r) if r == "invalid token"));

    let err = broker.await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::AuthRejected(_)));
}

#[tokio::test]
async fn test_handshake_times_out_when_client_is_silent() {
    let (_client_io, broker_io) = tokio::io::duplex(1024);
    let err = accept(
        broker_io,
        addr(),
        &AccessPolicy::Open,
        Duration::from_millis(100),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout));
}

#[tokio::test]
async fn test_request_success_and_failure() {
    let ((client, _client_in), (_broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    let responder = tokio::spawn(async move {
        let first = broker_in.requests.recv().await.unwrap();
        assert_eq!(first.kind(), "echo");
        let payload = first.payload();
        first.reply_success(payload).await.unwrap();

        let second = broker_in.requests.recv().await.unwrap();
        assert_eq!(second.kind(), "unknown");
        drop(second);
        broker_in
    });

    let reply = client
        .send_request("echo", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));

    let err = client.send_request("unknown", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, TransportError::RequestRejected { ref kind } if kind == "unknown"));

    let _broker_in = responder.await.unwrap();
}

#[tokio::test]
async fn test_channel_carries_bytes_both_ways_and_close() {
    let ((_client, mut client_in), (broker, _broker_in)) = pair(AccessPolicy::Open, "").await;

    let acceptor = tokio::spawn(async move {
        let incoming = client_in.channels.recv().await.unwrap();
        assert_eq!(incoming.kind(), "forwarded-tcpip");
        assert_eq!(incoming.payload(), Bytes::from_static(b"meta"));
        let mut stream = incoming.accept().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
        stream.write_all(b"PONG").await.unwrap();
        stream.shutdown().await.unwrap();
        (client_in, stream)
    });

    let mut stream = broker
        .open_channel("forwarded-tcpip", Bytes::from_static(b"meta"))
        .await
        .unwrap();
    assert_eq!(stream.id() % 2, 0);

    stream.write_all(b"PING").await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"PONG");

    let _ = acceptor.await.unwrap();
}

#[tokio::test]
async fn test_large_transfer_is_chunked_in_order() {
    let ((client, _client_in), (_broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();

    let acceptor = tokio::spawn(async move {
        let mut stream = broker_in.channels.recv().await.unwrap().accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut stream = client.open_channel("bulk", Bytes::new()).await.unwrap();
    assert_eq!(stream.id() % 2, 1);
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let received = tokio::time::timeout(TIMEOUT, acceptor).await.unwrap().unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_rejected_channel_open() {
    let ((client, _client_in), (_broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    let rejecter = tokio::spawn(async move {
        let incoming = broker_in.channels.recv().await.unwrap();
        incoming.reject("direct channel access not allowed").await.unwrap();
        broker_in
    });

    let err = client
        .open_channel("direct-tcpip", Bytes::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::ChannelRejected { ref reason } if reason == "direct channel access not allowed")
    );
    let _ = rejecter.await.unwrap();
}

#[tokio::test]
async fn test_close_fails_pending_request_and_ends_incoming() {
    let ((client, _client_in), (broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    // Hold the request unanswered so the client stays pending.
    let holder = tokio::spawn(async move {
        let request = broker_in.requests.recv().await.unwrap();
        broker.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(request);
        broker_in
    });

    let result = tokio::time::timeout(TIMEOUT, client.send_request("slow", Bytes::new()))
        .await
        .unwrap();
    assert!(result.is_err());

    tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
    assert!(client.is_closed());

    let mut broker_in = holder.await.unwrap();
    assert!(tokio::time::timeout(TIMEOUT, broker_in.requests.recv())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_peer_close_gives_channel_eof() {
    let ((client, _client_in), (broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    let acceptor = tokio::spawn(async move {
        let stream = broker_in.channels.recv().await.unwrap().accept().await.unwrap();
        (broker_in, stream)
    });
    let mut stream = client.open_channel("bulk", Bytes::new()).await.unwrap();
    let (_broker_in, _broker_stream) = acceptor.await.unwrap();

    broker.close();

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_writer_stalls_until_the_reader_drains() {
    let ((client, _client_in), (_broker, mut broker_in)) = pair(AccessPolicy::Open, "").await;

    let acceptor = tokio::spawn(async move {
        let stream = broker_in.channels.recv().await.unwrap().accept().await.unwrap();
        (broker_in, stream)
    });
    let stream = client.open_channel("bulk", Bytes::new()).await.unwrap();
    let (_broker_in, mut reader) = acceptor.await.unwrap();

    const TOTAL: usize = 8 * 1024 * 1024;
    let writer = tokio::spawn(async move {
        let mut stream = stream;
        let chunk = vec![0x5au8; 1024 * 1024];
        for _ in 0..TOTAL / chunk.len() {
            stream.write_all(&chunk).await.unwrap();
        }
        stream.shutdown().await.unwrap();
        stream
    });

    // Nobody reads, so the writer can only get about one window ahead
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!writer.is_finished());

    let mut received = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::time::timeout(TIMEOUT, reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|b| *b == 0x5a));
        received += n;
    }
    assert_eq!(received, TOTAL);

    let _stream = tokio::time::timeout(TIMEOUT, writer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sender_overrunning_the_window_loses_the_channel() {
    let (mut peer, io) = tokio::io::duplex(1024 * 1024);
    let (_broker, mut broker_in) = Connection::spawn(io, Role::Broker, addr(), BytesMut::new());
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::new();

    let open = Frame::ChannelOpen {
        channel: 1,
        kind: "bulk".to_string(),
        payload: Bytes::new(),
    };
    write_frame(&mut peer, &mut codec, open).await.unwrap();
    let _stream = broker_in.channels.recv().await.unwrap().accept().await.unwrap();
    assert_eq!(
        read_frame(&mut peer, &mut codec, &mut read_buf).await.unwrap(),
        Frame::ChannelOpenConfirm { channel: 1 }
    );

    // One chunk more than the window, with no grant in between
    let chunk = Bytes::from(vec![7u8; 16 * 1024]);
    for _ in 0..CHANNEL_WINDOW / chunk.len() + 1 {
        let data = Frame::ChannelData {
            channel: 1,
            data: chunk.clone(),
        };
        write_frame(&mut peer, &mut codec, data).await.unwrap();
    }

    let reply = tokio::time::timeout(TIMEOUT, read_frame(&mut peer, &mut codec, &mut read_buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Frame::ChannelClose { channel: 1 });
}

#[tokio::test]
async fn test_close_is_not_held_up_by_a_peer_that_stopped_reading() {
    let (_stalled_peer, io) = tokio::io::duplex(1024);
    let (conn, _incoming) = Connection::spawn(io, Role::Client, addr(), BytesMut::new());

    let sender = conn.clone();
    let pending = tokio::spawn(async move {
        sender
            .send_request("bulk", Bytes::from(vec![0u8; 64 * 1024]))
            .await
    });
    // Let the writer block on the full pipe
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close();

    tokio::time::timeout(TIMEOUT, conn.closed()).await.unwrap();
    let result = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
}
