use mp3cast_server::{
    EvictReason, ProcessorEvent, ProcessorState, ReleaseOutcome, ServerConfig, ServerError,
    StreamFormat, StreamProcessor,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        port: 0,
        handshake_timeout_ms: 1_000,
        drain_timeout_ms: 1_000,
        tick_interval_ms: 20,
        ..ServerConfig::default()
    }
}

async fn connect(addr: SocketAddr, request: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Read up to and including the blank line ending the response head
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(WAIT, stream.read(&mut byte)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed inside the response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut body))
        .await
        .unwrap()
        .unwrap();
    body
}

async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    rest
}

/// Receive events until `pred` matches; returns everything seen, match included
async fn wait_for(
    events: &mut UnboundedReceiver<ProcessorEvent>,
    mut pred: impl FnMut(&ProcessorEvent) -> bool,
) -> Vec<ProcessorEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_streaming(events: &mut UnboundedReceiver<ProcessorEvent>, count: usize) {
    let mut streaming = 0;
    wait_for(events, |e| {
        if matches!(e, ProcessorEvent::ClientStreaming { .. }) {
            streaming += 1;
        }
        streaming == count
    })
    .await;
}

fn releases(events: &[ProcessorEvent]) -> Vec<(u64, ReleaseOutcome)> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessorEvent::BufferReleased { seq, outcome } => Some((*seq, *outcome)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_client_receives_stream() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    let mut client = connect(addr, "GET /stream HTTP/1.0\r\n\r\n").await;
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(head.contains("Content-Type: audio/mpeg\r\n"));
    assert!(head.contains("icy-br: 128\r\n"));
    assert!(!head.contains("icy-metaint"));
    wait_streaming(&mut events, 1).await;

    let buffers: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 1000]).collect();
    for buffer in &buffers {
        handle.submit(buffer.clone()).unwrap();
    }

    let body = read_exactly(&mut client, 3000).await;
    assert_eq!(body, buffers.concat());

    let mut released = Vec::new();
    wait_for(&mut events, |e| {
        if let ProcessorEvent::BufferReleased { seq, outcome } = e {
            released.push((*seq, *outcome));
        }
        released.len() == 3
    })
    .await;
    assert_eq!(
        released,
        vec![
            (0, ReleaseOutcome::Consumed),
            (1, ReleaseOutcome::Consumed),
            (2, ReleaseOutcome::Consumed),
        ]
    );
    assert_eq!(handle.backlog(), 0);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.state, ProcessorState::Streaming);
    assert_eq!(stats.streaming_clients, 1);
    assert_eq!(stats.buffers_admitted, 3);
}

#[tokio::test]
async fn test_half_closed_request_still_served() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    // Request then FIN on the write side, like `nc -N`
    let mut client = connect(addr, "GET /stream HTTP/1.0\r\n\r\n").await;
    client.shutdown().await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    wait_streaming(&mut events, 1).await;

    handle.submit(vec![7u8; 500]).unwrap();
    assert_eq!(read_exactly(&mut client, 500).await, vec![7u8; 500]);
    assert_eq!(handle.stats().await.unwrap().clients, 1);

    // A rejected request that half-closes still gets its error response
    let mut rejected = connect(addr, "GET /other HTTP/1.1\r\n\r\n").await;
    rejected.shutdown().await.unwrap();
    let reply = String::from_utf8(read_until_closed(&mut rejected).await).unwrap();
    assert!(reply.starts_with("HTTP/1.0 404 "), "got {:?}", reply);

    // An unfinished request cannot complete once the peer stops sending
    let mut truncated = connect(addr, "GET /stream HTTP/1.1\r\n").await;
    truncated.shutdown().await.unwrap();
    assert!(read_until_closed(&mut truncated).await.is_empty());

    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ProcessorEvent::ClientEvicted {
                reason: EvictReason::PeerReset,
                ..
            }
        )
    })
    .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ProcessorEvent::ClientEvicted {
            reason: EvictReason::ProtocolError,
            ..
        }
    )));
    assert_eq!(handle.stats().await.unwrap().clients, 1);
}

#[tokio::test]
async fn test_clients_share_one_stream_in_order() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    let mut a = connect(addr, "GET /stream HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let mut b = connect(addr, "GET /stream?token=1 HTTP/1.1\r\n\r\n").await;
    assert!(read_head(&mut a).await.starts_with("HTTP/1.1 200 OK"));
    assert!(read_head(&mut b).await.starts_with("HTTP/1.1 200 OK"));
    wait_streaming(&mut events, 2).await;

    let mut expected = Vec::new();
    for i in 0..20u32 {
        let frame = i.to_be_bytes().repeat(100);
        expected.extend_from_slice(&frame);
        handle.submit(frame).unwrap();
    }

    assert_eq!(read_exactly(&mut a, expected.len()).await, expected);
    assert_eq!(read_exactly(&mut b, expected.len()).await, expected);
}

#[tokio::test]
async fn test_late_joiner_starts_at_live_edge() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    // Nobody listening: dropped, not buffered for later
    handle.submit(vec![0xAA; 64]).unwrap();
    let seen = wait_for(&mut events, |e| matches!(e, ProcessorEvent::BufferReleased { .. })).await;
    assert_eq!(releases(&seen), vec![(0, ReleaseOutcome::Dropped)]);

    let mut client = connect(addr, "GET /stream HTTP/1.0\r\n\r\n").await;
    read_head(&mut client).await;
    wait_streaming(&mut events, 1).await;

    handle.submit(vec![0xBB; 64]).unwrap();
    assert_eq!(read_exactly(&mut client, 64).await, vec![0xBB; 64]);
}

#[tokio::test]
async fn test_rejected_requests_get_error_and_close() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    let cases = [
        ("POST /stream HTTP/1.1\r\n\r\n", "HTTP/1.0 405 "),
        ("GET /other HTTP/1.1\r\n\r\n", "HTTP/1.0 404 "),
        ("garbage\r\n\r\n", "HTTP/1.0 400 "),
        ("GET /stream HTTP/2.0\r\n\r\n", "HTTP/1.0 505 "),
    ];

    for (request, status) in cases {
        let mut client = connect(addr, request).await;
        let reply = String::from_utf8(read_until_closed(&mut client).await).unwrap();
        assert!(reply.starts_with(status), "{:?} got {:?}", request, reply);

        wait_for(&mut events, |e| {
            matches!(
                e,
                ProcessorEvent::ClientEvicted {
                    reason: EvictReason::ProtocolError,
                    ..
                }
            )
        })
        .await;
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.clients, 0);
    assert_eq!(stats.clients_evicted, 4);
    assert_eq!(stats.state, ProcessorState::Listening);
}

#[tokio::test]
async fn test_handshake_timeout_closes_silent_client() {
    let config = ServerConfig {
        handshake_timeout_ms: 150,
        ..test_config()
    };
    let (handle, mut events, _task) =
        StreamProcessor::spawn(config, StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    // Half a request, never finished
    let mut client = connect(addr, "GET /stream HTTP/1.1\r\n").await;
    let reply = read_until_closed(&mut client).await;
    assert!(reply.is_empty());

    wait_for(&mut events, |e| {
        matches!(
            e,
            ProcessorEvent::ClientEvicted {
                reason: EvictReason::ProtocolError,
                ..
            }
        )
    })
    .await;
}

#[tokio::test]
async fn test_icy_metadata_interleaved() {
    let config = ServerConfig {
        metadata_interval: 8,
        ..test_config()
    };
    let (handle, mut events, _task) =
        StreamProcessor::spawn(config, StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();
    handle.set_stream_title("Night Shift").await.unwrap();

    let mut client = connect(addr, "GET /stream HTTP/1.1\r\nIcy-MetaData: 1\r\n\r\n").await;
    let head = read_head(&mut client).await;
    assert!(head.contains("icy-metaint: 8\r\n"));
    wait_streaming(&mut events, 1).await;

    handle.submit(&b"abcdefghijklmnopqrst"[..]).unwrap();

    let title = mp3cast_server::metadata::format_block("Night Shift");
    let mut expected = b"abcdefgh".to_vec();
    expected.extend_from_slice(&title);
    expected.extend_from_slice(b"ijklmnop");
    expected.push(0);
    expected.extend_from_slice(b"qrst");

    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.stream_title.as_deref(), Some("Night Shift"));
    assert!(stats.client_list[0].metadata);
}

#[tokio::test]
async fn test_pause_holds_buffers_until_overflow() {
    let config = ServerConfig {
        backlog_cap: 4,
        ..test_config()
    };
    let (handle, mut events, _task) =
        StreamProcessor::spawn(config, StreamFormat::default()).unwrap();
    handle.start().await.unwrap();
    handle.pause().await.unwrap();

    for i in 0..4u8 {
        handle.submit(vec![i; 16]).unwrap();
    }
    let err = handle.submit(vec![9; 16]).unwrap_err();
    assert!(err.is_overflow());
    assert!(handle.stats().await.unwrap().paused);

    handle.resume().await.unwrap();
    let mut count = 0;
    wait_for(&mut events, |e| {
        if matches!(e, ProcessorEvent::BufferReleased { .. }) {
            count += 1;
        }
        count == 4
    })
    .await;

    assert_eq!(handle.backlog(), 0);
    assert!(handle.submit(vec![5; 16]).is_ok());
}

#[tokio::test]
async fn test_stop_drains_and_releases_everything() {
    let (handle, mut events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    let mut client = connect(addr, "GET /stream HTTP/1.0\r\n\r\n").await;
    read_head(&mut client).await;
    wait_streaming(&mut events, 1).await;

    let mut expected = Vec::new();
    for i in 0..10u8 {
        let frame = vec![i; 2048];
        expected.extend_from_slice(&frame);
        handle.submit(frame).unwrap();
    }

    let reader = tokio::spawn(async move { read_until_closed(&mut client).await });
    handle.stop().await.unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ProcessorEvent::StateChanged {
                to: ProcessorState::Stopped,
                ..
            }
        )
    })
    .await;

    // Every buffer back exactly once
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for (seq, _) in releases(&seen) {
        *counts.entry(seq).or_default() += 1;
    }
    assert_eq!(counts.len(), 10);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(handle.backlog(), 0);

    // Queued audio is flushed before the close
    let body = reader.await.unwrap();
    assert_eq!(body, expected);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.state, ProcessorState::Stopped);
    assert!(stats.listen_addr.is_none());
    assert!(TcpStream::connect(addr).await.is_err());

    // Restartable
    handle.start().await.unwrap();
}

#[tokio::test]
async fn test_invalid_commands_rejected() {
    let (handle, _events, _task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();

    assert!(matches!(
        handle.stop().await,
        Err(ServerError::InvalidTransition {
            command: "stop",
            state: ProcessorState::Idle
        })
    ));
    assert!(handle.pause().await.is_err());

    handle.start().await.unwrap();
    assert!(matches!(
        handle.start().await,
        Err(ServerError::InvalidTransition { command: "start", .. })
    ));
}

#[tokio::test]
async fn test_start_fails_when_port_taken() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = ServerConfig {
        port: blocker.local_addr().unwrap().port(),
        ..test_config()
    };
    let (handle, mut events, _task) =
        StreamProcessor::spawn(config, StreamFormat::default()).unwrap();

    assert!(matches!(handle.start().await, Err(ServerError::Bind { .. })));
    wait_for(&mut events, |e| matches!(e, ProcessorEvent::Error { .. })).await;
    assert_eq!(handle.stats().await.unwrap().state, ProcessorState::Idle);
}

#[tokio::test]
async fn test_shutdown_ends_task() {
    let (handle, mut events, task) =
        StreamProcessor::spawn(test_config(), StreamFormat::default()).unwrap();
    let addr = handle.start().await.unwrap();

    let mut client = connect(addr, "GET /stream HTTP/1.0\r\n\r\n").await;
    read_head(&mut client).await;
    wait_streaming(&mut events, 1).await;

    handle.shutdown().await.unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ProcessorEvent::StateChanged {
                to: ProcessorState::Stopped,
                ..
            }
        )
    })
    .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ProcessorEvent::ClientEvicted {
            reason: EvictReason::ShutdownRequested,
            ..
        }
    )));

    assert!(matches!(
        handle.submit(vec![1]),
        Err(ServerError::ProcessorGone)
    ));
    assert!(matches!(handle.stats().await, Err(ServerError::ProcessorGone)));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = ServerConfig {
        mount_point: "stream".to_string(),
        ..test_config()
    };
    assert!(matches!(
        StreamProcessor::new(config, StreamFormat::default()),
        Err(ServerError::InvalidConfig(_))
    ));
}
