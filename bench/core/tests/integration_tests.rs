//! Integration tests for the bench server over real loopback sockets
//!
//! Tests cover:
//! - Greeting on connect
//! - Single active connection and superseded peers
//! - Inbound JSON and malformed payloads
//! - Disconnect, reconnect and bounded shutdown
//! - Diff reports and the swap pedal end to end
//! - Configuration file driving the bench

use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

use armbench_core::config::{load_config_with_env, ConfigSource};
use armbench_core::transport::frame::{read_frame, write_frame};
use armbench_core::{Bench, BenchEvent, TransportError, IS_SELECTED};

const FRAME_WAIT: Duration = Duration::from_millis(500);
const EVENT_WAIT: Duration = Duration::from_secs(2);

async fn started_bench() -> (Bench, SocketAddr) {
    let bench = Bench::new();
    let addr = bench.start("127.0.0.1", "0").await.unwrap();
    (bench, addr)
}

async fn read_json(stream: &mut TcpStream) -> Value {
    let payload = timeout(FRAME_WAIT, read_frame(stream))
        .await
        .expect("no frame within 500 ms")
        .unwrap();
    serde_json::from_slice(&payload).unwrap()
}

async fn connect_and_greet(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_json(&mut stream).await, json!({"SOCKET_ENABLE": true}));
    stream
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<BenchEvent>, pred: F) -> BenchEvent
where
    F: Fn(&BenchEvent) -> bool,
{
    timeout(EVENT_WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event sink closed"),
            }
        }
    })
    .await
    .expect("expected event not published")
}

fn is_status(event: &BenchEvent, needle: &str) -> bool {
    matches!(event, BenchEvent::Status(text) if text.contains(needle))
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_greeting_on_connect() {
    let (bench, addr) = started_bench().await;
    let mut events = bench.subscribe();

    let started = Instant::now();
    let _peer = connect_and_greet(addr).await;
    assert!(started.elapsed() < FRAME_WAIT);

    let sent = wait_for(&mut events, |e| matches!(e, BenchEvent::Sent(_))).await;
    assert_eq!(sent, BenchEvent::Sent(r#"{"SOCKET_ENABLE":true}"#.to_string()));
    wait_for(&mut events, |e| is_status(e, "message sent (22 bytes)")).await;

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_new_peer_supersedes_without_closing_old_one() {
    let (bench, addr) = started_bench().await;

    let mut peer_a = connect_and_greet(addr).await;
    let mut peer_b = connect_and_greet(addr).await;

    bench
        .set_attribute_selection(2, "esu_state", "coag", true)
        .unwrap();
    bench.send_arm_state(2).unwrap();

    assert_eq!(
        read_json(&mut peer_b).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 2, "esu_state": 1})
    );

    // A is neither written to nor closed while superseded.
    let quiet = timeout(Duration::from_millis(150), read_frame(&mut peer_a)).await;
    assert!(quiet.is_err(), "superseded peer received data");

    bench.stop().await.unwrap();

    // Shutdown closes A through its watcher.
    let closed = timeout(FRAME_WAIT, read_frame(&mut peer_a)).await.unwrap();
    assert!(matches!(closed, Err(TransportError::ConnectionClosed)));
}

#[tokio::test]
async fn test_disconnect_then_reconnect_is_greeted() {
    let (bench, addr) = started_bench().await;
    let mut events = bench.subscribe();

    let peer = connect_and_greet(addr).await;
    drop(peer);
    wait_for(&mut events, |e| is_status(e, "client disconnected")).await;
    assert!(!bench.server().slot().is_occupied());

    let _peer = connect_and_greet(addr).await;
    assert!(bench.server().slot().is_occupied());

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_port_fails_start() {
    let bench = Bench::new();
    let mut events = bench.subscribe();

    let result = bench.start("127.0.0.1", "port").await;
    assert!(matches!(result, Err(TransportError::InvalidPort(_))));
    assert!(!bench.server().is_running());
    wait_for(&mut events, |e| is_status(e, "Invalid port")).await;
}

#[tokio::test]
async fn test_stop_is_bounded_with_connected_peer() {
    let (bench, addr) = started_bench().await;
    let mut peer = connect_and_greet(addr).await;

    let started = Instant::now();
    bench.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!bench.server().is_running());

    let closed = timeout(FRAME_WAIT, read_frame(&mut peer)).await.unwrap();
    assert!(matches!(closed, Err(TransportError::ConnectionClosed)));
}

#[tokio::test]
async fn test_messages_without_peer_are_dropped() {
    let (bench, addr) = started_bench().await;

    bench
        .set_attribute_selection(0, "is_drape", "true", true)
        .unwrap();
    bench.send_arm_state(0).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bench.queue().is_empty());

    // The next peer sees only its greeting.
    let mut peer = connect_and_greet(addr).await;
    let nothing = timeout(Duration::from_millis(100), read_frame(&mut peer)).await;
    assert!(nothing.is_err());

    bench.stop().await.unwrap();
}

// =============================================================================
// Inbound traffic
// =============================================================================

#[tokio::test]
async fn test_inbound_json_and_malformed_payloads() {
    let (bench, addr) = started_bench().await;
    let mut events = bench.subscribe();
    let mut peer = connect_and_greet(addr).await;

    write_frame(&mut peer, b"{oops").await.unwrap();
    let malformed = wait_for(&mut events, |e| matches!(e, BenchEvent::Malformed(_))).await;
    assert_eq!(
        malformed.received_text().as_deref(),
        Some("<malformed JSON>: {oops")
    );

    write_frame(&mut peer, br#"{"ack":1}"#).await.unwrap();
    let received = wait_for(&mut events, |e| matches!(e, BenchEvent::Received(_))).await;
    assert_eq!(received, BenchEvent::Received(r#"{"ack":1}"#.to_string()));

    // Still connected after the bad frame.
    bench
        .set_attribute_selection(1, "manual_type", "su", true)
        .unwrap();
    bench.send_arm_state(1).unwrap();
    assert_eq!(
        read_json(&mut peer).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 1, "manual_type": 2})
    );

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_inbound_frame_drops_peer() {
    let (bench, addr) = started_bench().await;
    let mut events = bench.subscribe();
    let mut peer = connect_and_greet(addr).await;

    tokio::io::AsyncWriteExt::write_all(&mut peer, &[0xFF, 0xFF, 0xFF, 0xFF, 0])
        .await
        .unwrap();
    wait_for(&mut events, |e| is_status(e, "receive error")).await;
    assert!(!bench.server().slot().is_occupied());

    let closed = timeout(FRAME_WAIT, read_frame(&mut peer)).await.unwrap();
    assert!(matches!(closed, Err(TransportError::ConnectionClosed)));

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_frames_split_across_writes() {
    let (bench, addr) = started_bench().await;
    let mut events = bench.subscribe();
    let mut peer = connect_and_greet(addr).await;

    let frame = armbench_core::transport::frame::encode(br#"{"split":true}"#).unwrap();
    let (head, tail) = frame.split_at(4);
    tokio::io::AsyncWriteExt::write_all(&mut peer, head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::io::AsyncWriteExt::write_all(&mut peer, tail).await.unwrap();

    let received = wait_for(&mut events, |e| matches!(e, BenchEvent::Received(_))).await;
    assert_eq!(received, BenchEvent::Received(r#"{"split":true}"#.to_string()));

    bench.stop().await.unwrap();
}

// =============================================================================
// Diff reports
// =============================================================================

#[tokio::test]
async fn test_swap_pedal_end_to_end() {
    let (bench, addr) = started_bench().await;
    bench
        .set_attribute_selection(0, IS_SELECTED, "true", true)
        .unwrap();
    bench
        .set_attribute_selection(1, IS_SELECTED, "false", true)
        .unwrap();
    let mut peer = connect_and_greet(addr).await;

    bench.swap_pedal().unwrap();

    assert_eq!(
        read_json(&mut peer).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 0, "is_selected": 0})
    );
    assert_eq!(
        read_json(&mut peer).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 1, "is_selected": 1})
    );

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_fixed_selection_sent_once() {
    let (bench, addr) = started_bench().await;
    let mut peer = connect_and_greet(addr).await;

    bench
        .set_attribute_selection(3, "endoscope_type", "30 endoscope", true)
        .unwrap();
    bench
        .set_attribute_selection(3, "is_tracking", "true", false)
        .unwrap();
    assert!(bench.send_arm_state(3).unwrap().is_some());
    assert!(bench.send_arm_state(3).unwrap().is_none());

    assert_eq!(
        read_json(&mut peer).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 3, "endoscope_type": 2})
    );
    let nothing = timeout(Duration::from_millis(100), read_frame(&mut peer)).await;
    assert!(nothing.is_err());

    bench.stop().await.unwrap();
}

#[tokio::test]
async fn test_auto_send_reaches_peer() {
    let (bench, addr) = started_bench().await;
    let mut peer = connect_and_greet(addr).await;

    bench
        .set_attribute_selection(1, "is_clutched", "change", true)
        .unwrap();
    bench.scheduler().set_interval(Duration::from_millis(10));
    bench.scheduler().start_auto_send().unwrap();

    let first = read_json(&mut peer).await;
    let second = read_json(&mut peer).await;
    bench.shutdown().await;

    assert_eq!(first["arm_index"], 1);
    assert_eq!(second["arm_index"], 1);
    assert_ne!(first["is_clutched"], second["is_clutched"]);
    assert!(!bench.scheduler().is_auto_sending());
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_config_file_drives_bench() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[server]
ip = "127.0.0.1"
port = 0

[scheduler]
interval_ms = 20

[[selection]]
arm = 2
attribute = "instrument_type"
value = "clip applier"
"#,
    )
    .unwrap();

    let config = load_config_with_env(Some(file.path().to_path_buf()), |_| None).unwrap();
    assert_eq!(config.source(), ConfigSource::File);
    assert_eq!(config.port, "0");

    let bench = Bench::new();
    bench.apply_config(&config).unwrap();
    assert_eq!(bench.scheduler().interval(), Duration::from_millis(20));

    let addr = bench.start(&config.ip, &config.port).await.unwrap();
    let mut peer = connect_and_greet(addr).await;

    bench.send_arm_state(1).unwrap();
    assert_eq!(
        read_json(&mut peer).await,
        json!({"REPORT_TO_GUI": 0, "arm_index": 1, "instrument_type": 5})
    );

    bench.stop().await.unwrap();
}
