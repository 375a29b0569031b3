use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use dslink_core::{
    config::ConfigStore,
    envelope::{self, Envelope, Opcode},
};
use dslink_session::SessionManager;
use dslink_transport::{RawDecoder, TelemetryIngest, Uplink};
use serde_json::json;
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

async fn monitor() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv_envelope(socket: &UdpSocket) -> (Envelope, SocketAddr) {
    let mut buf = vec![0u8; 65_535];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    (envelope::decode(&buf[..len]).unwrap(), from)
}

#[tokio::test]
async fn uplink_exchanges_envelopes_and_drops_garbage() {
    let (monitor, monitor_addr) = monitor().await;
    let uplink = Arc::new(assert_ok!(Uplink::connect(&monitor_addr.to_string()).await));

    let outbound = Envelope::new(Opcode::Status, "", json!({"op": "status"}));
    assert_ok!(uplink.send(&outbound).await);
    let (received, from) = recv_envelope(&monitor).await;
    assert_eq!(received, outbound);

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(uplink.clone().receive_loop(tx, cancel.clone()));

    let reply = Envelope::new(Opcode::Status, "abc123", json!({"drone": {"name": "hexa"}}));
    monitor.send_to(b"\xD5\x01garbage", from).await.unwrap();
    monitor.send_to(&reply.encode().unwrap(), from).await.unwrap();

    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound, reply);

    cancel.cancel();
    assert_ok!(timeout(WAIT, task).await.unwrap().unwrap());
}

#[tokio::test]
async fn uplink_ignores_datagrams_from_other_senders() {
    let (monitor, monitor_addr) = monitor().await;
    let uplink = Arc::new(assert_ok!(Uplink::connect(&monitor_addr.to_string()).await));
    let agent_addr = SocketAddr::from(([127, 0, 0, 1], uplink.local_addr().unwrap().port()));

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(uplink.clone().receive_loop(tx, cancel.clone()));

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forged = Envelope::new(Opcode::Status, "abc123", json!({"codeBuffer": "echo 1"}));
    stranger.send_to(&forged.encode().unwrap(), agent_addr).await.unwrap();

    let genuine = Envelope::new(Opcode::Status, "abc123", json!({"op": "status"}));
    monitor.send_to(&genuine.encode().unwrap(), agent_addr).await.unwrap();

    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound, genuine);
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    assert_ok!(timeout(WAIT, task).await.unwrap().unwrap());
}

#[tokio::test]
async fn ingest_relays_frames_with_current_token() {
    let config_path: PathBuf =
        std::env::temp_dir().join(format!("dslink-ingest-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&config_path, r#"{"email":"a@b.c","password":"pw","serialId":"1-rust"}"#).unwrap();
    let session = Arc::new(SessionManager::new(Arc::new(
        ConfigStore::open(&config_path).unwrap(),
    )));

    let (monitor, monitor_addr) = monitor().await;
    let uplink = Arc::new(assert_ok!(Uplink::connect(&monitor_addr.to_string()).await));
    let ingest = assert_ok!(TelemetryIngest::bind("127.0.0.1:0", Arc::new(RawDecoder)).await);
    let ingest_addr = ingest.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingest.run(uplink, session.clone(), cancel.clone()));

    let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    source.send_to(&[0xFE, 0x09, 0x00], ingest_addr).await.unwrap();
    let (relayed, _) = recv_envelope(&monitor).await;
    assert_eq!(relayed.opcode, Opcode::Telemetry);
    assert_eq!(relayed.session_token, "");
    assert_eq!(relayed.payload["header"], "RAW");
    assert_eq!(relayed.payload["data"]["len"], 3);

    // Bind the session, then the next frame carries the token.
    assert_ok!(session.tick(dslink_core::job::JobStatus::idle()).await);
    session
        .on_envelope(&Envelope::new(Opcode::Status, "abc123", json!({})))
        .await;
    source.send_to(&[0x01], ingest_addr).await.unwrap();
    let (relayed, _) = recv_envelope(&monitor).await;
    assert_eq!(relayed.session_token, "abc123");

    cancel.cancel();
    assert_ok!(timeout(WAIT, task).await.unwrap().unwrap());
    let _ = std::fs::remove_file(config_path);
}
