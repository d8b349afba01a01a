//! End-to-end: scheduler + real BGP session + shell probes against a
//! scripted router on loopback.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use beacon_bgp::codec::{self, CodecOptions};
use beacon_bgp::{
    BgpSession, Message, NotificationMessage, OpenMessage, SessionConfig, SessionState, read_frame,
};
use beacon_core::{AddressFamily, Config, Prefix};
use beacon_engine::{Peer, Scheduler, TargetState};
use beacon_health::CommandProbe;

const FOUR_OCTET: CodecOptions = CodecOptions { four_octet_as: true };

async fn read_message(stream: &mut TcpStream) -> Message {
    let frame = read_frame(stream).await.unwrap();
    codec::decode(&frame, FOUR_OCTET).unwrap()
}

/// Next message that is not a KEEPALIVE.
async fn next_update(stream: &mut TcpStream) -> Message {
    loop {
        match read_message(stream).await {
            Message::Keepalive => continue,
            other => return other,
        }
    }
}

async fn establish(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let plain = CodecOptions::default();

    let frame = read_frame(&mut stream).await.unwrap();
    assert!(matches!(codec::decode(&frame, plain).unwrap(), Message::Open(_)));

    let open = OpenMessage::new(65000, 30, Ipv4Addr::new(192, 0, 2, 254), AddressFamily::Ipv4);
    for message in [Message::Open(open), Message::Keepalive] {
        let bytes = codec::encode(&message, plain).unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    let frame = read_frame(&mut stream).await.unwrap();
    assert_eq!(codec::decode(&frame, plain).unwrap(), Message::Keepalive);
    stream
}

async fn wait_for(state: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("session never reached {want}"))
        .unwrap();
}

#[tokio::test]
async fn health_changes_drive_updates_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("healthy");

    let toml = format!(
        r#"
[daemon]
tick_interval_ms = 10
check_interval_secs = 1
connect_retry_secs = 60

[[peers]]
enabled = true
name = "router"
local_address = "127.0.0.1"
remote_address = "127.0.0.1"
remote_port = {port}
local_as = 65010
remote_as = 65000
address_family = "ipv4"

[[peers.targets]]
name = "web"
check = "test -f {marker}"
destination = "127.0.0.1"
prefixes = ["192.0.2.10/32"]
"#,
        marker = marker.display()
    );
    let (mut settings, specs) = Config::from_toml_str(&toml).unwrap().into_parts();
    settings.check_interval = Duration::from_millis(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (session, session_task) =
        BgpSession::start(SessionConfig::from_spec(&specs[0], &settings), shutdown_rx);
    let mut state = session.watch_state();

    let mut router = establish(&listener).await;
    wait_for(&mut state, SessionState::Established).await;

    let probe = Arc::new(CommandProbe::new(Duration::from_secs(2)));
    let peer = Peer::from_spec(&specs[0], &settings, Box::new(session), probe);
    let mut scheduler = Scheduler::new(settings, vec![peer]);

    // Unhealthy and withdrawn: nothing to send.
    scheduler.tick().await;
    assert!(scheduler.peer(0).unwrap().is_ok());
    assert_eq!(scheduler.peer(0).unwrap().advertised(), 0);

    std::fs::write(&marker, b"").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    scheduler.tick().await;
    assert_eq!(
        scheduler.peer(0).unwrap().targets()[0].state(),
        TargetState::Advertised
    );

    let prefix: Prefix = "192.0.2.10/32".parse().unwrap();
    match next_update(&mut router).await {
        Message::Update(update) => assert_eq!(update.announced(), vec![prefix]),
        other => panic!("expected UPDATE, got {other:?}"),
    }

    std::fs::remove_file(&marker).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    scheduler.tick().await;
    match next_update(&mut router).await {
        Message::Update(update) => {
            assert!(update.is_withdraw());
            assert_eq!(update.withdrawn_prefixes(), vec![prefix]);
        }
        other => panic!("expected UPDATE, got {other:?}"),
    }

    // Router goes away: the next tick forgets the announcement.
    std::fs::write(&marker, b"").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    scheduler.tick().await;
    assert!(matches!(next_update(&mut router).await, Message::Update(_)));

    let cease = codec::encode(
        &Message::Notification(NotificationMessage::administrative_shutdown()),
        FOUR_OCTET,
    )
    .unwrap();
    router.write_all(&cease).await.unwrap();
    wait_for(&mut state, SessionState::Idle).await;

    scheduler.tick().await;
    let peer = scheduler.peer(0).unwrap();
    assert!(!peer.is_ok());
    assert_eq!(peer.advertised(), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session task did not stop")
        .unwrap();
}

#[tokio::test]
async fn large_target_is_announced_without_dropping_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let prefixes: Vec<String> = (0..1100)
        .map(|i| format!("\"10.{}.{}.0/24\"", i / 256, i % 256))
        .collect();
    let toml = format!(
        r#"
[daemon]
connect_retry_secs = 60

[[peers]]
enabled = true
name = "router"
local_address = "127.0.0.1"
remote_address = "127.0.0.1"
remote_port = {port}
local_as = 65010
remote_as = 65000
address_family = "ipv4"

[[peers.targets]]
name = "bulk"
check = "true"
destination = "127.0.0.1"
prefixes = [{}]
"#,
        prefixes.join(", ")
    );
    let (settings, specs) = Config::from_toml_str(&toml).unwrap().into_parts();
    let expected = specs[0].targets[0].prefixes.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (session, session_task) =
        BgpSession::start(SessionConfig::from_spec(&specs[0], &settings), shutdown_rx);
    let mut state = session.watch_state();

    let mut router = establish(&listener).await;
    wait_for(&mut state, SessionState::Established).await;

    let probe = Arc::new(CommandProbe::new(Duration::from_secs(2)));
    let peer = Peer::from_spec(&specs[0], &settings, Box::new(session), probe);
    let mut scheduler = Scheduler::new(settings, vec![peer]);

    scheduler.tick().await;
    let peer = scheduler.peer(0).unwrap();
    assert!(peer.is_ok());
    assert_eq!(peer.targets()[0].state(), TargetState::Advertised);

    let mut announced = Vec::new();
    let mut updates = 0;
    while announced.len() < expected.len() {
        match next_update(&mut router).await {
            Message::Update(update) => {
                updates += 1;
                announced.extend(update.announced());
            }
            other => panic!("expected UPDATE, got {other:?}"),
        }
    }
    assert!(updates >= 2);
    assert_eq!(announced, expected);
    assert_eq!(*state.borrow(), SessionState::Established);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session task did not stop")
        .unwrap();
}
