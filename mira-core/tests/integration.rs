//! Integration tests — session lifecycle, control round-trips, and
//! fan-out delivery over a real WebSocket connection on localhost.
//!
//! No GPU, display, audio device, or codec runtime is needed: the
//! pipeline stages under test are driven through their queues.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use mira_core::stream::fanout::FanOut;
use mira_core::stream::queue::FrameQueue;
use mira_core::stream::types::{AudioPacket, EncodedVideoFrame};
use mira_core::stream::PipelineStats;
use mira_core::wire::{self, WireFrame};
use mira_core::{ClientRegistry, KeyframeSignal, Server, StreamConfig};

// ── Helpers ──────────────────────────────────────────────────────

struct TestServer {
    port: u16,
    registry: Arc<ClientRegistry>,
    keyframe: Arc<KeyframeSignal>,
    video_q: Arc<FrameQueue<EncodedVideoFrame>>,
    audio_q: Arc<FrameQueue<AudioPacket>>,
    cancel: CancellationToken,
}

/// Bind an ephemeral port, start the accept loop and a fan-out worker
/// wired to test-controlled queues.
async fn start_server(max_clients: usize) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let keyframe = KeyframeSignal::new();
    let registry = ClientRegistry::new(max_clients, Arc::clone(&keyframe));
    let cancel = CancellationToken::new();

    let config = StreamConfig {
        max_clients,
        ports: vec![port],
        ..StreamConfig::default()
    };
    let server = Server::new(config, Arc::clone(&registry));
    tokio::spawn(server.serve_listener(listener, cancel.clone()));

    let video_q = Arc::new(FrameQueue::new(16));
    let audio_q = Arc::new(FrameQueue::new(16));
    let fanout = FanOut::new(
        Arc::clone(&video_q),
        Arc::clone(&audio_q),
        Arc::clone(&registry),
        Arc::new(PipelineStats::default()),
    );
    tokio::spawn(fanout.run(cancel.clone()));

    TestServer {
        port,
        registry,
        keyframe,
        video_q,
        audio_q,
        cancel,
    }
}

async fn connect(port: u16) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("websocket connect");
    ws
}

/// Wait until the registry sees `n` sessions (registration happens
/// after the handshake, on the server's schedule).
async fn wait_for_clients(registry: &ClientRegistry, n: usize) {
    for _ in 0..100 {
        if registry.client_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached {n} clients");
}

fn key_frame(seq: u64, payload: &[u8]) -> EncodedVideoFrame {
    EncodedVideoFrame {
        data: payload.to_vec(),
        cursor: (0.25, 0.75),
        is_keyframe: true,
        sequence: seq,
    }
}

fn p_frame(seq: u64) -> EncodedVideoFrame {
    EncodedVideoFrame {
        data: vec![0x41; 32],
        cursor: (0.5, 0.5),
        is_keyframe: false,
        sequence: seq,
    }
}

async fn next_binary<S>(ws: &mut S) -> Vec<u8>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(data) = msg {
            return data;
        }
    }
}

// ── Health endpoint ──────────────────────────────────────────────

#[tokio::test]
async fn plain_get_returns_health_text() {
    let srv = start_server(4).await;

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", srv.port))
        .await
        .unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("mira streaming server"));

    srv.cancel.cancel();
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn connect_arms_keyframe_and_first_frame_is_keyframe() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    // Admission armed the process-wide request.
    assert!(srv.keyframe.take());

    // P-frames published before the keyframe never reach the client.
    let _ = srv.video_q.push(p_frame(0));
    let _ = srv.video_q.push(p_frame(1));
    let _ = srv.video_q.push(key_frame(2, &[0, 0, 0, 1, 0x65, 0xAA]));

    let first = next_binary(&mut ws).await;
    match wire::parse(&first).unwrap() {
        WireFrame::Video {
            is_keyframe,
            cursor,
            payload,
        } => {
            assert!(is_keyframe, "first delivered frame must be an I-frame");
            assert_eq!(cursor, (0.25, 0.75));
            assert_eq!(payload[..4], [0, 0, 0, 1]);
        }
        other => panic!("wrong frame: {other:?}"),
    }

    srv.cancel.cancel();
}

#[tokio::test]
async fn request_keyframe_round_trip() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;
    srv.keyframe.take();

    ws.send(Message::Text(
        r#"{"type":"hello","client":"test","version":2}"#.into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(r#"{"type":"request_keyframe"}"#.into()))
        .await
        .unwrap();

    // The control plane re-arms the encoder latch.
    for _ in 0..100 {
        if srv.keyframe.is_armed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(srv.keyframe.take(), "request_keyframe must arm the latch");

    srv.cancel.cancel();
}

#[tokio::test]
async fn malformed_and_unknown_control_does_not_disconnect() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"warp_drive"}"#.into()))
        .await
        .unwrap();

    // Still attached and still receiving media.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(srv.registry.client_count(), 1);

    let _ = srv.video_q.push(key_frame(0, &[0, 0, 0, 1, 0x65]));
    let frame = next_binary(&mut ws).await;
    assert!(matches!(
        wire::parse(&frame).unwrap(),
        WireFrame::Video { .. }
    ));

    srv.cancel.cancel();
}

#[tokio::test]
async fn capacity_cap_refuses_excess_clients_cleanly() {
    let srv = start_server(1).await;

    let _first = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    // The second handshake succeeds but the server closes immediately
    // without ever streaming.
    let mut second = connect(srv.port).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("refused connection should close promptly");
    match msg {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("refused client received {other:?}"),
    }
    assert_eq!(srv.registry.client_count(), 1);

    srv.cancel.cancel();
}

#[tokio::test]
async fn disconnect_frees_the_slot() {
    let srv = start_server(1).await;

    let ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;
    drop(ws);
    wait_for_clients(&srv.registry, 0).await;

    // Reconnect reuses the slot and is treated as brand new.
    let _ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;
    assert!(srv.keyframe.take());

    srv.cancel.cancel();
}

// ── Media delivery ───────────────────────────────────────────────

#[tokio::test]
async fn late_joiner_waits_for_its_own_keyframe() {
    let srv = start_server(4).await;

    let mut early = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    let _ = srv.video_q.push(key_frame(0, &[0, 0, 0, 1, 0x65]));
    let _ = next_binary(&mut early).await;
    let _ = srv.video_q.push(p_frame(1));
    let _ = next_binary(&mut early).await;

    // B joins mid-GOP: P-frames keep flowing to A but never to B.
    let mut late = connect(srv.port).await;
    wait_for_clients(&srv.registry, 2).await;

    let _ = srv.video_q.push(p_frame(2));
    let to_early = next_binary(&mut early).await;
    assert!(matches!(
        wire::parse(&to_early).unwrap(),
        WireFrame::Video {
            is_keyframe: false,
            ..
        }
    ));

    let _ = srv.video_q.push(key_frame(3, &[0, 0, 0, 1, 0x65, 0x01]));
    let first_to_late = next_binary(&mut late).await;
    assert!(matches!(
        wire::parse(&first_to_late).unwrap(),
        WireFrame::Video {
            is_keyframe: true,
            ..
        }
    ));

    srv.cancel.cancel();
}

#[tokio::test]
async fn jpeg_fallback_frames_keep_the_cursor_header() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    // Encoder-fallback shape: keyframe flag set, JPEG payload.
    let jpeg_payload = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    let _ = srv.video_q.push(key_frame(0, &jpeg_payload));

    let frame = next_binary(&mut ws).await;
    match wire::parse(&frame).unwrap() {
        WireFrame::Video {
            is_keyframe,
            payload,
            ..
        } => {
            assert!(is_keyframe);
            assert_eq!(&payload[..2], &[0xFF, 0xD8], "JPEG follows the cursor header");
        }
        other => panic!("wrong frame: {other:?}"),
    }

    srv.cancel.cancel();
}

#[tokio::test]
async fn audio_reaches_clients_that_still_await_video() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    let _ = srv.audio_q.push(AudioPacket {
        data: vec![0, 0, 0, 0, 0, 0, 0x07, 0x89],
    });

    let frame = next_binary(&mut ws).await;
    match wire::parse(&frame).unwrap() {
        WireFrame::Audio { packet } => assert_eq!(packet.len(), 8),
        other => panic!("wrong frame: {other:?}"),
    }

    srv.cancel.cancel();
}

#[tokio::test]
async fn video_sequences_arrive_in_order_with_gaps_allowed() {
    let srv = start_server(4).await;

    let mut ws = connect(srv.port).await;
    wait_for_clients(&srv.registry, 1).await;

    let _ = srv.video_q.push(key_frame(10, &[0, 0, 0, 1, 0x65]));
    let _ = srv.video_q.push(p_frame(11));
    let _ = srv.video_q.push(p_frame(14)); // gap: encoder held 12–13

    let mut seen = Vec::new();
    for _ in 0..3 {
        let frame = next_binary(&mut ws).await;
        match wire::parse(&frame).unwrap() {
            WireFrame::Video { is_keyframe, .. } => seen.push(is_keyframe),
            other => panic!("wrong frame: {other:?}"),
        }
    }
    assert_eq!(seen, vec![true, false, false]);

    srv.cancel.cancel();
}
