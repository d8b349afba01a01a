//! Outbound BGP session, one task per configured peer.
//!
//! The task connects, negotiates OPEN, then keeps the session alive and
//! writes queued UPDATEs until the connection drops or shutdown is
//! signalled. After a drop it waits `connect_retry` and starts again;
//! callers never manage reconnects.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::{AddressFamily, DaemonSettings, PeerSpec};

use crate::codec::{self, CodecOptions};
use crate::error::SessionError;
use crate::message::*;

/// RFC 4271 suggests a large hold time while waiting for the peer's OPEN.
const INITIAL_HOLD_TIME: Duration = Duration::from_secs(240);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The two primitives the advertisement engine needs from a peering.
pub trait ProtocolSession: Send + Sync {
    fn is_established(&self) -> bool;

    /// Queue an UPDATE for the peer. An UPDATE that cannot be encoded is
    /// rejected here and never reaches the connection.
    fn send(&self, update: UpdateMessage) -> Result<(), SessionError>;

    /// Number of times the session has reached Established.
    fn generation(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connect => write!(f, "connect"),
            SessionState::OpenSent => write!(f, "open-sent"),
            SessionState::OpenConfirm => write!(f, "open-confirm"),
            SessionState::Established => write!(f, "established"),
        }
    }
}

/// Everything the session task needs to reach one peer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label for log events.
    pub peer: String,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub local_as: u32,
    pub remote_as: Option<u32>,
    pub router_id: Ipv4Addr,
    pub address_family: AddressFamily,
    pub hold_time: u16,
    pub connect_retry: Duration,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn from_spec(spec: &PeerSpec, settings: &DaemonSettings) -> Self {
        Self {
            peer: spec.name.clone(),
            local_address: spec.local_address,
            remote_address: spec.remote_address,
            remote_port: spec.remote_port,
            local_as: spec.local_as,
            remote_as: spec.remote_as,
            router_id: spec.router_id,
            address_family: spec.address_family,
            hold_time: spec.hold_time,
            connect_retry: settings.connect_retry,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Handle to a running session task.
pub struct BgpSession {
    state: watch::Receiver<SessionState>,
    generation: Arc<AtomicU64>,
    four_octet_as: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// An encoded UPDATE and the generation it was accepted under.
#[derive(Debug)]
struct Outbound {
    generation: u64,
    frame: Bytes,
}

impl Outbound {
    /// The frame, if it belongs to the session that is up now.
    fn into_current(self, current: u64) -> Option<Bytes> {
        (self.generation == current).then_some(self.frame)
    }
}

impl BgpSession {
    /// Spawn the session task. It runs until `shutdown` flips to true.
    pub fn start(config: SessionConfig, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let four_octet_as = Arc::new(AtomicBool::new(false));

        let driver = SessionDriver {
            config,
            state: state_tx,
            generation: Arc::clone(&generation),
            four_octet_as: Arc::clone(&four_octet_as),
            outbound: outbound_rx,
            shutdown,
        };
        let handle = tokio::spawn(driver.run());

        (
            Self {
                state: state_rx,
                generation,
                four_octet_as,
                outbound: outbound_tx,
            },
            handle,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

impl ProtocolSession for BgpSession {
    fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    fn send(&self, update: UpdateMessage) -> Result<(), SessionError> {
        // Read the generation before the state: if the session turns over in
        // between, the tag is stale and the task discards the frame.
        let generation = self.generation();
        if !self.is_established() {
            return Err(SessionError::NotEstablished);
        }
        let opts = CodecOptions {
            four_octet_as: self.four_octet_as.load(Ordering::Acquire),
        };
        let frame = codec::encode(&Message::Update(update), opts)?;
        self.outbound
            .send(Outbound { generation, frame })
            .map_err(|_| SessionError::Closed)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

// ── Session task ───────────────────────────────────────────────────

enum Event {
    Message(Message),
    Shutdown,
}

struct SessionDriver {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    generation: Arc<AtomicU64>,
    four_octet_as: Arc<AtomicBool>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
}

impl SessionDriver {
    async fn run(mut self) {
        let peer = self.config.peer.clone();
        let remote = SocketAddr::new(self.config.remote_address, self.config.remote_port);
        info!(%peer, %remote, "bgp session task started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let outcome = self.connect_and_serve().await;
            let was_established = *self.state.borrow() == SessionState::Established;
            self.state.send_replace(SessionState::Idle);
            // Anything still queued was meant for the session that just ended.
            while self.outbound.try_recv().is_ok() {}

            match outcome {
                Ok(()) => break,
                Err(e) if was_established => warn!(%peer, error = %e, "bgp session dropped"),
                Err(e) => debug!(%peer, error = %e, "bgp connection attempt failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.connect_retry) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.state.send_replace(SessionState::Idle);
        info!(%peer, "bgp session task stopped");
    }

    /// One connection lifetime. `Ok(())` means shutdown was requested.
    async fn connect_and_serve(&mut self) -> Result<(), SessionError> {
        self.state.send_replace(SessionState::Connect);

        let stream = tokio::select! {
            result = connect(&self.config) => result?,
            _ = self.shutdown.changed() => return Ok(()),
        };
        let (reader, mut writer) = stream.into_split();

        let (frames_tx, mut frames) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_frames(reader, frames_tx));

        let result = self.serve(&mut writer, &mut frames).await;
        reader_task.abort();
        let _ = writer.shutdown().await;
        result
    }

    async fn serve(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<Result<Bytes, SessionError>>,
    ) -> Result<(), SessionError> {
        let mut opts = CodecOptions::default();
        let open = OpenMessage::new(
            self.config.local_as,
            self.config.hold_time,
            self.config.router_id,
            self.config.address_family,
        );
        write_message(writer, &Message::Open(open), opts).await?;
        self.state.send_replace(SessionState::OpenSent);

        let peer_open = match self.next_event(frames, INITIAL_HOLD_TIME, opts).await? {
            Event::Shutdown => return Ok(()),
            Event::Message(Message::Open(open)) => open,
            Event::Message(Message::Notification(n)) => {
                return Err(SessionError::PeerNotification(n));
            }
            Event::Message(_) => {
                return Err(notify(writer, NotificationMessage::fsm_error(), opts).await);
            }
        };

        let hold = self.negotiate(&peer_open, writer, opts).await?;
        opts.four_octet_as = peer_open.supports_four_octet_as();

        write_message(writer, &Message::Keepalive, opts).await?;
        self.state.send_replace(SessionState::OpenConfirm);

        let confirm_wait = if hold.is_zero() { INITIAL_HOLD_TIME } else { hold };
        match self.next_event(frames, confirm_wait, opts).await? {
            Event::Shutdown => {
                let _ = notify(writer, NotificationMessage::administrative_shutdown(), opts).await;
                return Ok(());
            }
            Event::Message(Message::Keepalive) => {}
            Event::Message(Message::Notification(n)) => {
                return Err(SessionError::PeerNotification(n));
            }
            Event::Message(_) => {
                return Err(notify(writer, NotificationMessage::fsm_error(), opts).await);
            }
        }

        // Bump the generation before publishing Established so an observer
        // that sees Established also sees the new generation.
        self.four_octet_as.store(opts.four_octet_as, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(SessionState::Established);
        info!(
            peer = %self.config.peer,
            peer_as = peer_open.peer_as(),
            hold_secs = hold.as_secs(),
            four_octet_as = opts.four_octet_as,
            "bgp session established"
        );

        self.established(writer, frames, hold, opts).await
    }

    /// Validate the peer's OPEN and return the negotiated hold time.
    async fn negotiate(
        &self,
        open: &OpenMessage,
        writer: &mut OwnedWriteHalf,
        opts: CodecOptions,
    ) -> Result<Duration, SessionError> {
        if open.version != BGP_VERSION {
            let n = NotificationMessage::open_error(NotificationMessage::OPEN_UNSUPPORTED_VERSION);
            return Err(notify(writer, n, opts).await);
        }
        if let Some(expected) = self.config.remote_as
            && open.peer_as() != expected
        {
            warn!(
                peer = %self.config.peer,
                expected,
                received = open.peer_as(),
                "peer AS mismatch"
            );
            let n = NotificationMessage::open_error(NotificationMessage::OPEN_BAD_PEER_AS);
            return Err(notify(writer, n, opts).await);
        }
        if open.router_id.is_unspecified() {
            let n = NotificationMessage::open_error(NotificationMessage::OPEN_BAD_BGP_IDENTIFIER);
            return Err(notify(writer, n, opts).await);
        }
        if open.hold_time == 1 || open.hold_time == 2 {
            let n =
                NotificationMessage::open_error(NotificationMessage::OPEN_UNACCEPTABLE_HOLD_TIME);
            return Err(notify(writer, n, opts).await);
        }
        if !open.supports_family(self.config.address_family) {
            warn!(
                peer = %self.config.peer,
                family = %self.config.address_family,
                "peer did not advertise multiprotocol support for our family"
            );
        }

        let hold = open.hold_time.min(self.config.hold_time);
        Ok(Duration::from_secs(u64::from(hold)))
    }

    async fn established(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<Result<Bytes, SessionError>>,
        hold: Duration,
        opts: CodecOptions,
    ) -> Result<(), SessionError> {
        let timers = !hold.is_zero();
        let keepalive_every = if timers { hold / 3 } else { Duration::from_secs(3600) };
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        let mut hold_deadline = Instant::now() + hold;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let message = match frame {
                        Some(Ok(bytes)) => codec::decode(&bytes, opts)?,
                        Some(Err(e)) => return Err(e),
                        None => return Err(SessionError::ConnectionClosed),
                    };
                    hold_deadline = Instant::now() + hold;
                    match message {
                        Message::Keepalive => {}
                        Message::Update(update) => {
                            debug!(
                                peer = %self.config.peer,
                                announced = update.announced().len(),
                                withdrawn = update.withdrawn_prefixes().len(),
                                "ignoring routes received from peer"
                            );
                        }
                        Message::Notification(n) => return Err(SessionError::PeerNotification(n)),
                        Message::Open(_) => {
                            return Err(notify(writer, NotificationMessage::fsm_error(), opts).await);
                        }
                    }
                }
                Some(queued) = self.outbound.recv() => {
                    let queued_for = queued.generation;
                    let current = self.generation.load(Ordering::Acquire);
                    match queued.into_current(current) {
                        Some(frame) => writer.write_all(&frame).await?,
                        None => debug!(
                            peer = %self.config.peer,
                            queued_for,
                            current,
                            "discarding update queued for an earlier session"
                        ),
                    }
                }
                _ = keepalive.tick(), if timers => {
                    write_message(writer, &Message::Keepalive, opts).await?;
                }
                _ = tokio::time::sleep_until(hold_deadline), if timers => {
                    return Err(notify(writer, NotificationMessage::hold_timer_expired(), opts).await);
                }
                _ = self.shutdown.changed() => {
                    let _ = notify(writer, NotificationMessage::administrative_shutdown(), opts).await;
                    return Ok(());
                }
            }
        }
    }

    async fn next_event(
        &mut self,
        frames: &mut mpsc::Receiver<Result<Bytes, SessionError>>,
        within: Duration,
        opts: CodecOptions,
    ) -> Result<Event, SessionError> {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(bytes)) => Ok(Event::Message(codec::decode(&bytes, opts)?)),
                Some(Err(e)) => Err(e),
                None => Err(SessionError::ConnectionClosed),
            },
            _ = tokio::time::sleep(within) => Err(SessionError::HoldTimerExpired),
            _ = self.shutdown.changed() => Ok(Event::Shutdown),
        }
    }
}

async fn connect(config: &SessionConfig) -> Result<TcpStream, SessionError> {
    let socket = match config.local_address {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(config.local_address, 0))?;

    let remote = SocketAddr::new(config.remote_address, config.remote_port);
    let stream = tokio::time::timeout(config.connect_timeout, socket.connect(remote))
        .await
        .map_err(|_| SessionError::ConnectTimeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Send a NOTIFICATION and return the error that ends the connection.
async fn notify(
    writer: &mut OwnedWriteHalf,
    notification: NotificationMessage,
    opts: CodecOptions,
) -> SessionError {
    let message = Message::Notification(notification.clone());
    if let Err(e) = write_message(writer, &message, opts).await {
        debug!(error = %e, "failed to send notification");
    }
    SessionError::LocalNotification(notification)
}

async fn write_message(
    writer: &mut OwnedWriteHalf,
    message: &Message,
    opts: CodecOptions,
) -> Result<(), SessionError> {
    let bytes = codec::encode(message, opts)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

async fn read_frames(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Bytes, SessionError>>) {
    loop {
        let frame = read_frame(&mut reader).await;
        let failed = frame.is_err();
        if tx.send(frame).await.is_err() || failed {
            break;
        }
    }
}

/// Read one complete message frame, header included.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, SessionError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;
    let len = codec::frame_length(&header)?;

    let mut frame = BytesMut::with_capacity(len);
    frame.extend_from_slice(&header);
    frame.resize(len, 0);
    reader
        .read_exact(&mut frame[HEADER_LEN..])
        .await
        .map_err(eof_as_closed)?;
    Ok(frame.freeze())
}

fn eof_as_closed(e: std::io::Error) -> SessionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::ConnectionClosed
    } else {
        SessionError::Io(e)
    }
}
