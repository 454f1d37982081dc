//! End-to-end client protocol: publish, subscribe, deliver, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_broker::{server, Broker, BrokerConfig};
use courier_core::protocol::{
    read_response, unpack_response, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE,
    HEARTBEAT, MAGIC_V2,
};
use courier_core::Message;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(MAGIC_V2).await.unwrap();
        Self { stream }
    }

    async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\n").await.unwrap();
    }

    async fn send_with_body(&mut self, line: &str, body: &[u8]) {
        self.send(line).await;
        self.stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        self.stream.write_all(body).await.unwrap();
    }

    /// Next non-heartbeat frame.
    async fn next_frame(&mut self) -> (i32, Bytes) {
        loop {
            let buf = timeout(Duration::from_secs(5), read_response(&mut self.stream))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            let (frame_type, payload) = unpack_response(buf).unwrap();
            if frame_type == FRAME_TYPE_RESPONSE && payload == HEARTBEAT {
                continue;
            }
            return (frame_type, payload);
        }
    }

    async fn expect_ok(&mut self) {
        let (frame_type, payload) = self.next_frame().await;
        assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
        assert_eq!(&payload[..], b"OK");
    }
}

async fn start_broker() -> (Arc<Broker>, String, tempfile::TempDir) {
    let data_dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig {
        data_path: data_dir.path().to_path_buf(),
        msg_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let (broker, _notify_rx) = Broker::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server::serve(Arc::clone(&broker), listener));
    (broker, addr, data_dir)
}

#[tokio::test]
async fn publish_subscribe_finish() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut consumer = TestClient::connect(&addr).await;
    consumer.send("SUB greetings workers").await;
    consumer.expect_ok().await;
    consumer.send("RDY 1").await;

    let mut producer = TestClient::connect(&addr).await;
    producer.send_with_body("PUB greetings", b"hello").await;
    producer.expect_ok().await;

    let (frame_type, payload) = consumer.next_frame().await;
    assert_eq!(frame_type, FRAME_TYPE_MESSAGE);
    let msg = Message::decode(payload).unwrap();
    assert_eq!(msg.body, Bytes::from_static(b"hello"));
    assert_eq!(msg.attempts, 1);

    consumer.send(&format!("FIN {}", msg.id)).await;
    consumer.send("CLS").await;
    let (frame_type, payload) = consumer.next_frame().await;
    assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
    assert_eq!(&payload[..], b"CLOSE_WAIT");
}

#[tokio::test]
async fn requeued_message_is_redelivered() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut consumer = TestClient::connect(&addr).await;
    consumer.send("SUB jobs workers").await;
    consumer.expect_ok().await;
    consumer.send("RDY 2").await;

    let mut producer = TestClient::connect(&addr).await;
    producer.send_with_body("PUB jobs", b"retry me").await;
    producer.expect_ok().await;

    let (_, payload) = consumer.next_frame().await;
    let first = Message::decode(payload).unwrap();
    assert_eq!(first.attempts, 1);

    consumer.send(&format!("REQ {} 100", first.id)).await;
    let (_, payload) = consumer.next_frame().await;
    let second = Message::decode(payload).unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
    consumer.send(&format!("FIN {}", second.id)).await;
}

#[tokio::test]
async fn mpub_delivers_every_message() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut consumer = TestClient::connect(&addr).await;
    consumer.send("SUB batch workers").await;
    consumer.expect_ok().await;
    consumer.send("RDY 10").await;

    let mut producer = TestClient::connect(&addr).await;
    let bodies: Vec<&[u8]> = vec![b"one", b"two", b"three"];
    let mut batch = Vec::new();
    batch.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
    for body in &bodies {
        batch.extend_from_slice(&(body.len() as u32).to_be_bytes());
        batch.extend_from_slice(body);
    }
    producer.send_with_body("MPUB batch", &batch).await;
    producer.expect_ok().await;

    let mut received = Vec::new();
    for _ in 0..bodies.len() {
        let (frame_type, payload) = consumer.next_frame().await;
        assert_eq!(frame_type, FRAME_TYPE_MESSAGE);
        let msg = Message::decode(payload).unwrap();
        consumer.send(&format!("FIN {}", msg.id)).await;
        received.push(msg.body);
    }
    received.sort();
    assert_eq!(
        received,
        vec![Bytes::from_static(b"one"), Bytes::from_static(b"three"), Bytes::from_static(b"two")]
    );
}

#[tokio::test]
async fn subscribers_load_balance_within_a_channel() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut first = TestClient::connect(&addr).await;
    first.send("SUB shared workers").await;
    first.expect_ok().await;
    first.send("RDY 1").await;

    let mut second = TestClient::connect(&addr).await;
    second.send("SUB shared workers").await;
    second.expect_ok().await;
    second.send("RDY 1").await;

    let mut producer = TestClient::connect(&addr).await;
    producer.send_with_body("PUB shared", b"m1").await;
    producer.expect_ok().await;
    producer.send_with_body("PUB shared", b"m2").await;
    producer.expect_ok().await;

    // Each subscriber holds one RDY credit, so each gets exactly one of
    // the two messages.
    let (ft1, p1) = first.next_frame().await;
    let (ft2, p2) = second.next_frame().await;
    assert_eq!(ft1, FRAME_TYPE_MESSAGE);
    assert_eq!(ft2, FRAME_TYPE_MESSAGE);
    let m1 = Message::decode(p1).unwrap();
    let m2 = Message::decode(p2).unwrap();
    assert_ne!(m1.id, m2.id);
    first.send(&format!("FIN {}", m1.id)).await;
    second.send(&format!("FIN {}", m2.id)).await;
}

#[tokio::test]
async fn paused_channel_holds_delivery() {
    let (broker, addr, _data_dir) = start_broker().await;

    let mut consumer = TestClient::connect(&addr).await;
    consumer.send("SUB paused workers").await;
    consumer.expect_ok().await;
    consumer.send("RDY 1").await;

    let channel =
        broker.get_existing_topic("paused").unwrap().get_existing_channel("workers").unwrap();
    channel.pause();

    let mut producer = TestClient::connect(&addr).await;
    producer.send_with_body("PUB paused", b"held").await;
    producer.expect_ok().await;

    // The message accumulates but is not handed to the subscriber.
    let nothing =
        timeout(Duration::from_millis(300), read_response(&mut consumer.stream)).await;
    assert!(nothing.is_err());
    assert_eq!(channel.depth(), 1);

    channel.unpause();
    let (frame_type, payload) = consumer.next_frame().await;
    assert_eq!(frame_type, FRAME_TYPE_MESSAGE);
    let msg = Message::decode(payload).unwrap();
    assert_eq!(msg.body, Bytes::from_static(b"held"));
}

#[tokio::test]
async fn ephemeral_channel_vanishes_with_its_last_client() {
    let (broker, addr, _data_dir) = start_broker().await;

    let consumer = {
        let mut consumer = TestClient::connect(&addr).await;
        consumer.send("SUB transient listeners#ephemeral").await;
        consumer.expect_ok().await;
        consumer
    };
    let topic = broker.get_existing_topic("transient").unwrap();
    assert!(topic.get_existing_channel("listeners#ephemeral").is_ok());

    drop(consumer);
    for _ in 0..100 {
        if topic.get_existing_channel("listeners#ephemeral").is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("ephemeral channel survived its last client");
}

#[tokio::test]
async fn bad_commands_get_error_frames() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut client = TestClient::connect(&addr).await;
    client.send("RDY 1").await;
    let (frame_type, payload) = client.next_frame().await;
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(payload.starts_with(b"E_INVALID"));
}

#[tokio::test]
async fn pub_to_invalid_topic_is_rejected() {
    let (_broker, addr, _data_dir) = start_broker().await;

    let mut client = TestClient::connect(&addr).await;
    client.send_with_body("PUB bad\u{20}topic", b"x").await;
    let (frame_type, payload) = client.next_frame().await;
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(payload.starts_with(b"E_BAD_TOPIC") || payload.starts_with(b"E_INVALID"));
}
