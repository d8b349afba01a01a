//! Drives a real `BgpSession` against a scripted router on loopback.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use beacon_bgp::codec::{self, CodecOptions};
use beacon_bgp::*;
use beacon_core::{AddressFamily, Prefix, SAFI_UNICAST};

const ROUTER_AS: u32 = 65000;
const LOCAL_AS: u32 = 65010;

fn session_config(port: u16) -> SessionConfig {
    SessionConfig {
        peer: "router".to_string(),
        local_address: "127.0.0.1".parse().unwrap(),
        remote_address: "127.0.0.1".parse().unwrap(),
        remote_port: port,
        local_as: LOCAL_AS,
        remote_as: Some(ROUTER_AS),
        router_id: Ipv4Addr::new(127, 0, 0, 1),
        address_family: AddressFamily::Ipv4,
        hold_time: 9,
        connect_retry: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(2),
    }
}

async fn read_message(stream: &mut TcpStream, opts: CodecOptions) -> Message {
    let frame = read_frame(stream).await.unwrap();
    codec::decode(&frame, opts).unwrap()
}

async fn write_message(stream: &mut TcpStream, message: &Message, opts: CodecOptions) {
    let bytes = codec::encode(message, opts).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

/// Accept one connection and complete the OPEN / KEEPALIVE exchange.
async fn accept_and_establish(listener: &TcpListener, router_as: u32) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let opts = CodecOptions::default();

    let open = match read_message(&mut stream, opts).await {
        Message::Open(open) => open,
        other => panic!("expected OPEN, got {other:?}"),
    };
    assert_eq!(open.peer_as(), LOCAL_AS);
    assert_eq!(open.hold_time, 9);
    assert!(open.supports_family(AddressFamily::Ipv4));

    let ours = OpenMessage::new(router_as, 90, Ipv4Addr::new(192, 0, 2, 254), AddressFamily::Ipv4);
    write_message(&mut stream, &Message::Open(ours), opts).await;
    write_message(&mut stream, &Message::Keepalive, opts).await;

    assert_eq!(read_message(&mut stream, opts).await, Message::Keepalive);
    stream
}

async fn wait_for(session: &BgpSession, want: SessionState) {
    let mut state = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("session never reached {want}"))
        .unwrap();
}

#[tokio::test]
async fn establishes_and_delivers_updates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (session, handle) = BgpSession::start(session_config(port), shutdown_rx);
    let mut router = accept_and_establish(&listener, ROUTER_AS).await;
    wait_for(&session, SessionState::Established).await;

    assert!(session.is_established());
    assert_eq!(session.generation(), 1);

    let prefix: Prefix = "192.0.2.10/32".parse().unwrap();
    let update = UpdateMessage {
        attributes: vec![
            PathAttribute::Origin(Default::default()),
            PathAttribute::AsPath(vec![LOCAL_AS]),
            PathAttribute::MpReachNlri {
                family: AddressFamily::Ipv4,
                safi: SAFI_UNICAST,
                next_hop: "10.0.0.2".parse().unwrap(),
                nlri: vec![prefix],
            },
        ],
        ..Default::default()
    };
    session.send(update.clone()).unwrap();

    // Both sides advertised 4-octet AS support.
    let opts = CodecOptions { four_octet_as: true };
    let received = loop {
        match read_message(&mut router, opts).await {
            Message::Keepalive => continue,
            other => break other,
        }
    };
    assert_eq!(received, Message::Update(update));

    shutdown_tx.send(true).unwrap();
    let cease = loop {
        match read_message(&mut router, opts).await {
            Message::Notification(n) => break n,
            _ => continue,
        }
    };
    assert_eq!(cease, NotificationMessage::administrative_shutdown());

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session task did not stop")
        .unwrap();
    assert!(!session.is_established());
}

#[tokio::test]
async fn peer_notification_drops_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (session, handle) = BgpSession::start(session_config(port), shutdown_rx);
    let mut router = accept_and_establish(&listener, ROUTER_AS).await;
    wait_for(&session, SessionState::Established).await;

    write_message(
        &mut router,
        &Message::Notification(NotificationMessage::administrative_shutdown()),
        CodecOptions { four_octet_as: true },
    )
    .await;

    wait_for(&session, SessionState::Idle).await;
    assert!(matches!(
        session.send(UpdateMessage::default()),
        Err(SessionError::NotEstablished)
    ));
    // The generation only moves on the next successful establish.
    assert_eq!(session.generation(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session task did not stop")
        .unwrap();
}

#[tokio::test]
async fn rejects_unexpected_peer_as() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (session, handle) = BgpSession::start(session_config(port), shutdown_rx);
    let (mut router, _) = listener.accept().await.unwrap();
    let opts = CodecOptions::default();

    assert!(matches!(read_message(&mut router, opts).await, Message::Open(_)));
    let wrong = OpenMessage::new(64999, 90, Ipv4Addr::new(192, 0, 2, 254), AddressFamily::Ipv4);
    write_message(&mut router, &Message::Open(wrong), opts).await;

    match read_message(&mut router, opts).await {
        Message::Notification(n) => {
            assert_eq!(n.code, NotificationMessage::OPEN_MESSAGE_ERROR);
            assert_eq!(n.subcode, NotificationMessage::OPEN_BAD_PEER_AS);
        }
        other => panic!("expected NOTIFICATION, got {other:?}"),
    }
    assert!(!session.is_established());
    assert_eq!(session.generation(), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session task did not stop")
        .unwrap();
}

#[tokio::test]
async fn oversize_update_is_refused_and_session_survives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (session, handle) = BgpSession::start(session_config(port), shutdown_rx);
    let mut router = accept_and_establish(&listener, ROUTER_AS).await;
    wait_for(&session, SessionState::Established).await;

    let announce = |count: usize| {
        let nlri = (0..count)
            .map(|i| format!("10.{}.{}.0/24", i / 256, i % 256).parse::<Prefix>().unwrap())
            .collect();
        UpdateMessage {
            attributes: vec![PathAttribute::MpReachNlri {
                family: AddressFamily::Ipv4,
                safi: SAFI_UNICAST,
                next_hop: "10.0.0.2".parse().unwrap(),
                nlri,
            }],
            ..Default::default()
        }
    };

    assert!(matches!(
        session.send(announce(1100)),
        Err(SessionError::Codec(CodecError::TooLong(_)))
    ));

    let fits = announce(1000);
    session.send(fits.clone()).unwrap();
    let opts = CodecOptions { four_octet_as: true };
    let received = loop {
        match read_message(&mut router, opts).await {
            Message::Keepalive => continue,
            other => break other,
        }
    };
    assert_eq!(received, Message::Update(fits));
    assert!(session.is_established());
    assert_eq!(session.generation(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session task did not stop")
        .unwrap();
}
