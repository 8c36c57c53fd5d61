//! End-to-end tests for the bus relay.
//!
//! Each test binds a relay on a socket inside a temp directory, runs it on a
//! spawned task, and talks to it through real Unix socket clients.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use xzibit_bus::{BusClient, Config, Frame, Relay};

const TIMEOUT: Duration = Duration::from_secs(2);

struct TestBus {
    socket_path: PathBuf,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
    _tmp: tempfile::TempDir,
}

impl TestBus {
    fn start() -> Self {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            socket_path: tmp.path().join("bus.sock"),
            ..Config::default()
        };
        let relay = Relay::bind(&config).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(relay.run_until(async {
            let _ = stop_rx.await;
        }));

        Self {
            socket_path: config.socket_path,
            stop_tx,
            handle,
            _tmp: tmp,
        }
    }

    async fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket_path).await.unwrap();
        // Let the relay register the connection before anyone sends
        settle().await;
        stream
    }

    async fn stop(self) {
        let _ = self.stop_tx.send(());
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("Relay did not stop")
            .unwrap()
            .unwrap();
        assert!(!self.socket_path.exists());
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn read_exact(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for relayed bytes")
        .expect("Read failed");
    buf
}

/// Asserts nothing arrives on `stream` for a short while.
async fn assert_silent(stream: &mut UnixStream) {
    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await;
    assert!(result.is_err(), "Expected no data, got {result:?}");
}

#[tokio::test]
async fn test_new_window_frame_relayed_unchanged() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;

    let raw = [7u8, 0, 0, 0, 1, 127, 0, 0, 1, 9, 28];
    a.write_all(&raw).await.unwrap();

    assert_eq!(read_exact(&mut b, raw.len()).await, raw);
    assert_silent(&mut a).await;

    bus.stop().await;
}

#[tokio::test]
async fn test_frame_reaches_all_other_clients() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;
    let mut c = bus.connect().await;

    let frame = Frame::from_payload(b"\x09opaque body").unwrap();
    b.write_all(frame.as_bytes()).await.unwrap();

    assert_eq!(read_exact(&mut a, frame.as_bytes().len()).await, frame.as_bytes());
    assert_eq!(read_exact(&mut c, frame.as_bytes().len()).await, frame.as_bytes());
    assert_silent(&mut b).await;

    bus.stop().await;
}

#[tokio::test]
async fn test_split_frame_withheld_until_complete() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;

    let frame = Frame::from_payload(&[1, 10, 0, 0, 2, 0x50, 0x00]).unwrap();
    let bytes = frame.as_bytes();

    a.write_all(&bytes[..2]).await.unwrap();
    settle().await;
    a.write_all(&bytes[2..6]).await.unwrap();
    assert_silent(&mut b).await;

    a.write_all(&bytes[6..]).await.unwrap();
    assert_eq!(read_exact(&mut b, bytes.len()).await, bytes);

    bus.stop().await;
}

#[tokio::test]
async fn test_multiple_frames_in_one_write_relayed_in_order() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;

    let frames = [
        Frame::from_payload(b"\x02one").unwrap(),
        Frame::from_payload(&[]).unwrap(),
        Frame::from_payload(b"\x03three").unwrap(),
    ];
    let mut bytes = Vec::new();
    for frame in &frames {
        bytes.extend_from_slice(frame.as_bytes());
    }
    a.write_all(&bytes).await.unwrap();

    assert_eq!(read_exact(&mut b, bytes.len()).await, bytes);

    bus.stop().await;
}

#[tokio::test]
async fn test_frame_larger_than_read_chunk() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;

    // Several default-sized reads are needed to assemble this
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let frame = Frame::from_payload(&payload).unwrap();
    a.write_all(frame.as_bytes()).await.unwrap();

    let got = read_exact(&mut b, frame.as_bytes().len()).await;
    assert_eq!(got, frame.as_bytes());

    bus.stop().await;
}

#[tokio::test]
async fn test_short_new_window_still_forwarded() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;

    let raw = [3u8, 0, 0, 0, 1, 127, 0];
    a.write_all(&raw).await.unwrap();

    assert_eq!(read_exact(&mut b, raw.len()).await, raw);

    bus.stop().await;
}

#[tokio::test]
async fn test_lone_client_frame_is_noop() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;

    a.write_all(Frame::from_payload(b"\x01").unwrap().as_bytes()).await.unwrap();
    assert_silent(&mut a).await;

    // Relay is still serving
    let mut b = bus.connect().await;
    let frame = Frame::from_payload(b"\x05after").unwrap();
    a.write_all(frame.as_bytes()).await.unwrap();
    assert_eq!(read_exact(&mut b, frame.as_bytes().len()).await, frame.as_bytes());

    bus.stop().await;
}

#[tokio::test]
async fn test_disconnected_client_leaves_fanout() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let b = bus.connect().await;
    let mut c = bus.connect().await;

    drop(b);
    settle().await;

    let frame = Frame::from_payload(b"\x07still here").unwrap();
    a.write_all(frame.as_bytes()).await.unwrap();
    assert_eq!(read_exact(&mut c, frame.as_bytes().len()).await, frame.as_bytes());

    // And the other direction keeps working too
    c.write_all(frame.as_bytes()).await.unwrap();
    assert_eq!(read_exact(&mut a, frame.as_bytes().len()).await, frame.as_bytes());

    bus.stop().await;
}

#[tokio::test]
async fn test_interleaved_senders_keep_per_connection_order() {
    let bus = TestBus::start();
    let mut a = bus.connect().await;
    let mut b = bus.connect().await;
    let mut listener = BusClient::from_stream(bus.connect().await);

    for i in 0u8..5 {
        a.write_all(Frame::from_payload(&[0x10, i]).unwrap().as_bytes()).await.unwrap();
        b.write_all(Frame::from_payload(&[0x20, i]).unwrap().as_bytes()).await.unwrap();
    }

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for _ in 0..10 {
        let frame = tokio::time::timeout(TIMEOUT, listener.recv_frame())
            .await
            .expect("Timed out")
            .unwrap()
            .expect("Bus closed");
        match frame.payload() {
            [0x10, i] => from_a.push(*i),
            [0x20, i] => from_b.push(*i),
            other => panic!("Unexpected payload: {other:?}"),
        }
    }

    assert_eq!(from_a, vec![0, 1, 2, 3, 4]);
    assert_eq!(from_b, vec![0, 1, 2, 3, 4]);

    bus.stop().await;
}

#[tokio::test]
async fn test_bus_clients_exchange_messages() {
    let bus = TestBus::start();
    let mut sender = BusClient::connect(&bus.socket_path).await.unwrap();
    let mut receiver = BusClient::connect(&bus.socket_path).await.unwrap();
    settle().await;

    let message = xzibit_bus::Message::NewWindow {
        addr: std::net::Ipv4Addr::new(192, 168, 1, 20),
        port: 5900,
    };
    sender.send_message(&message).await.unwrap();

    let frame = tokio::time::timeout(TIMEOUT, receiver.recv_frame())
        .await
        .expect("Timed out")
        .unwrap()
        .expect("Bus closed");
    assert_eq!(xzibit_bus::Message::decode(frame.payload()), message);
    assert_eq!(
        xzibit_bus::message::describe(frame.payload()),
        "new window on 192.168.1.20:5900"
    );

    sender.close().await.unwrap();
    bus.stop().await;
}
