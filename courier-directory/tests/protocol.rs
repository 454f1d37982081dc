//! Directory TCP protocol: identify, register/unregister, liveness, and
//! disconnect cleanup.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::protocol::{
    read_response, unpack_response, FRAME_TYPE_ERROR, FRAME_TYPE_RESPONSE, MAGIC_V1, MAGIC_V2,
};
use courier_core::{Command, PeerAnnounce};
use courier_directory::{protocol, Directory, DirectoryConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn start_directory() -> (Arc<Directory>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let dir = Directory::new(DirectoryConfig::default());
    tokio::spawn(protocol::serve(Arc::clone(&dir), listener));
    (dir, addr)
}

fn announce() -> PeerAnnounce {
    PeerAnnounce {
        tcp_port: 4150,
        http_port: 4151,
        version: "0.4.0".into(),
        broadcast_address: "10.0.0.9".into(),
        hostname: "broker-9".into(),
    }
}

struct TestPeer {
    stream: TcpStream,
}

impl TestPeer {
    async fn connect_v2(addr: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(MAGIC_V2).await.unwrap();
        Self { stream }
    }

    async fn command(&mut self, cmd: Command) -> (i32, Bytes) {
        cmd.write_to(&mut self.stream).await.unwrap();
        let buf = timeout(Duration::from_secs(5), read_response(&mut self.stream))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        unpack_response(buf).unwrap()
    }

    async fn identify(&mut self) {
        let (frame_type, payload) =
            self.command(Command::identify(&announce()).unwrap()).await;
        assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
        let identity: PeerAnnounce = serde_json::from_slice(&payload).unwrap();
        assert!(!identity.hostname.is_empty());
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn identify_then_register() {
    let (dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    let (frame_type, payload) = peer.command(Command::register("orders", Some("workers"))).await;
    assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
    assert_eq!(&payload[..], b"OK");

    assert_eq!(dir.db.find_registrations("topic", "orders", "").len(), 1);
    assert_eq!(dir.db.find_registrations("channel", "orders", "workers").len(), 1);
    assert_eq!(dir.db.find_producers("client", "", "").len(), 1);
}

#[tokio::test]
async fn register_requires_identify() {
    let (_dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;

    let (frame_type, payload) = peer.command(Command::register("orders", None)).await;
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(payload.starts_with(b"E_INVALID"));

    // The violation is fatal: the connection is closed.
    let eof = timeout(Duration::from_secs(5), read_response(&mut peer.stream)).await.unwrap();
    assert!(eof.is_err());
}

#[tokio::test]
async fn identify_twice_is_fatal() {
    let (_dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    let (frame_type, payload) =
        peer.command(Command::identify(&announce()).unwrap()).await;
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(payload.starts_with(b"E_INVALID"));
}

#[tokio::test]
async fn bad_topic_name_is_rejected() {
    let (_dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    let (frame_type, payload) =
        peer.command(Command::register(&"x".repeat(64), None)).await;
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(payload.starts_with(b"E_BAD_TOPIC"));
}

#[tokio::test]
async fn unregister_topic_sweeps_channel_registrations() {
    let (dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    peer.command(Command::register("orders", Some("c1"))).await;
    peer.command(Command::register("orders", Some("c2"))).await;
    let (frame_type, _) = peer.command(Command::unregister("orders", None)).await;
    assert_eq!(frame_type, FRAME_TYPE_RESPONSE);

    assert!(dir.db.find_producers("topic", "orders", "").is_empty());
    assert!(dir.db.find_producers("channel", "orders", "*").is_empty());
}

#[tokio::test]
async fn ephemeral_registration_vanishes_on_disconnect() {
    let (dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    peer.command(Command::register("orders", Some("c#ephemeral"))).await;
    assert_eq!(dir.db.find_registrations("channel", "orders", "*").len(), 1);

    drop(peer);
    wait_until(|| dir.db.find_producers("channel", "orders", "c#ephemeral").is_empty()).await;
    wait_until(|| dir.db.find_registrations("channel", "orders", "*").is_empty()).await;
    // Durable registrations survive the disconnect (with no producers).
    assert_eq!(dir.db.find_registrations("topic", "orders", "").len(), 1);
    wait_until(|| dir.db.find_producers("topic", "orders", "").is_empty()).await;
}

#[tokio::test]
async fn explicit_ephemeral_unregister_removes_registration() {
    let (dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    peer.identify().await;

    peer.command(Command::register("orders", Some("c#ephemeral"))).await;
    peer.command(Command::unregister("orders", Some("c#ephemeral"))).await;
    assert!(dir.db.find_registrations("channel", "orders", "*").is_empty());
}

#[tokio::test]
async fn ping_works_before_identify() {
    let (_dir, addr) = start_directory().await;
    let mut peer = TestPeer::connect_v2(&addr).await;
    let (frame_type, payload) = peer.command(Command::ping()).await;
    assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
    assert_eq!(&payload[..], b"OK");
}

#[tokio::test]
async fn v1_clients_get_unframed_responses() {
    let (_dir, addr) = start_directory().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(MAGIC_V1).await.unwrap();

    Command::ping().write_to(&mut stream).await.unwrap();
    let body = timeout(Duration::from_secs(5), read_response(&mut stream))
        .await
        .expect("timed out waiting for response")
        .unwrap();
    // No frame-type word on V1.
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn unknown_magic_is_rejected() {
    let (_dir, addr) = start_directory().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"  V9").await.unwrap();

    let eof = timeout(Duration::from_secs(5), read_response(&mut stream)).await.unwrap();
    assert!(eof.is_err());
}
