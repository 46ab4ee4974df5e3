//! CIP connections over a byte stream: dial (client), accept (host), and the
//! per-connection reader and writer tasks.
//!
//! The reader task decodes packets and feeds them to the [`Session`]. Everything
//! written to the stream goes through the single writer task, which merges handshake
//! and heartbeat frames with outbound transitions from the shared [`Joins`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use cip_core::task::UpdateTask;
use cip_core::wire::{self, parse_header, HEADER_SIZE};
use cip_core::{
    encode_transition, encode_update, ConnState, Ipid, Joins, Packet, Session, SessionAction,
    SessionError, SubscriberId, Transition, DEFAULT_QUEUE_CAPACITY,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound transition queue. A full queue drops new transitions.
    pub outbound_queue: usize,
    /// Send a ping this often. `None` only answers the peer's pings.
    pub ping_interval: Option<Duration>,
    /// Close the connection if it is not ready within this time.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_QUEUE_CAPACITY,
            ping_interval: None,
            handshake_timeout: None,
        }
    }
}

/// Errors from connecting or from a running connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("network must be tcp or tcp4, got {0:?}")]
    InvalidNetwork(String),
    #[error("IPID must be between 0x03 and 0xFE inclusive, got {0}")]
    InvalidIpid(Ipid),
    #[error("no usable address for {0}")]
    NoAddress(String),
    #[error("failed to read expected length")]
    ShortRead,
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Dial a CIP host with a fresh [`Joins`]. `network` is `tcp` or `tcp4`; `address` is
/// usually the host on port 41794 (e.g. `10.0.0.1:41794`).
pub async fn dial(network: &str, address: &str, ipid: Ipid) -> Result<Connection, ConnectionError> {
    dial_with_joins(
        network,
        address,
        ipid,
        Arc::new(Joins::new()),
        ConnectionConfig::default(),
    )
    .await
}

/// Dial a CIP host using an existing [`Joins`], which is synchronized once online.
pub async fn dial_with_joins(
    network: &str,
    address: &str,
    ipid: Ipid,
    joins: Arc<Joins>,
    config: ConnectionConfig,
) -> Result<Connection, ConnectionError> {
    let v4_only = match network {
        "tcp" => false,
        "tcp4" => true,
        other => return Err(ConnectionError::InvalidNetwork(other.to_string())),
    };
    if !ipid.is_valid_client() {
        return Err(ConnectionError::InvalidIpid(ipid));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await?
        .filter(|a| !v4_only || a.is_ipv4())
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::NoAddress(address.to_string()));
    }
    let stream = TcpStream::connect(&addrs[..]).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr().ok();
    info!(%address, %ipid, "connected to CIP host");
    Ok(Connection::spawn(
        stream,
        Session::client(ipid),
        joins,
        config,
        peer,
    ))
}

/// Accept one inbound CIP connection with a fresh [`Joins`].
pub async fn accept(listener: &TcpListener) -> Result<Connection, ConnectionError> {
    accept_with_joins(
        listener,
        Arc::new(Joins::new()),
        ConnectionConfig::default(),
    )
    .await
}

/// Accept one inbound CIP connection using an existing [`Joins`].
pub async fn accept_with_joins(
    listener: &TcpListener,
    joins: Arc<Joins>,
    config: ConnectionConfig,
) -> Result<Connection, ConnectionError> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    info!(%peer, "accepted CIP client");
    Ok(Connection::spawn(
        stream,
        Session::host(),
        joins,
        config,
        Some(peer),
    ))
}

struct Shared {
    session: Session,
    last_error: Option<Arc<ConnectionError>>,
}

struct Inner {
    joins: Arc<Joins>,
    shared: RwLock<Shared>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    subscriber: SubscriberId,
    shutdown: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
}

/// An active CIP link. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Run the client side of the protocol over `stream`. Must be called within a tokio runtime.
    pub fn client<S>(stream: S, ipid: Ipid, joins: Arc<Joins>, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, Session::client(ipid), joins, config, None)
    }

    /// Run the host side of the protocol over `stream`. Must be called within a tokio runtime.
    pub fn host<S>(stream: S, joins: Arc<Joins>, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, Session::host(), joins, config, None)
    }

    fn spawn<S>(
        stream: S,
        session: Session,
        joins: Arc<Joins>,
        config: ConnectionConfig,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (subscriber, transitions) = joins.attach(config.outbound_queue);
        let (shutdown, _) = watch::channel(false);
        let conn = Connection {
            inner: Arc::new(Inner {
                joins,
                shared: RwLock::new(Shared {
                    session,
                    last_error: None,
                }),
                frames: frames_tx,
                subscriber,
                shutdown,
                peer_addr,
            }),
        };

        tokio::spawn(write_loop(
            conn.clone(),
            writer,
            frames_rx,
            transitions,
            conn.inner.shutdown.subscribe(),
        ));
        tokio::spawn(read_loop(
            conn.clone(),
            reader,
            conn.inner.shutdown.subscribe(),
        ));
        if let Some(interval) = config.ping_interval {
            tokio::spawn(ping_loop(
                conn.clone(),
                interval,
                conn.inner.shutdown.subscribe(),
            ));
        }
        if let Some(timeout) = config.handshake_timeout {
            tokio::spawn(handshake_deadline(
                conn.clone(),
                timeout,
                conn.inner.shutdown.subscribe(),
            ));
        }

        let actions = conn.write().session.start();
        if let Err(e) = conn.perform(actions) {
            conn.fail(e);
        }
        conn
    }

    /// The signal table this connection reads from and writes to.
    pub fn joins(&self) -> &Arc<Joins> {
        &self.inner.joins
    }

    pub fn state(&self) -> ConnState {
        self.read().session.state()
    }

    /// Client IPID of the link: ours when dialing, the peer's when hosting.
    pub fn peer_ipid(&self) -> Ipid {
        self.read().session.ipid()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.read().session.last_heartbeat()
    }

    /// The error that closed the connection, if any.
    pub fn last_error(&self) -> Option<Arc<ConnectionError>> {
        self.read().last_error.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Outbound transitions dropped by the shared [`Joins`] because a queue was full.
    pub fn dropped_transitions(&self) -> u64 {
        self.inner.joins.dropped_transitions()
    }

    /// One-line status: state, IPID and time since the last heartbeat.
    pub fn status(&self) -> String {
        self.read().session.to_string()
    }

    pub fn is_closed(&self) -> bool {
        self.read().session.is_closed()
    }

    /// Send a ping with a zero payload.
    pub fn send_ping(&self) -> Result<(), ConnectionError> {
        self.send_frame(wire::ping([0, 0]))
    }

    /// Close the stream without recording an error.
    pub fn close(&self) {
        {
            let mut shared = self.write();
            if shared.session.is_closed() {
                return;
            }
            shared.session.close();
        }
        info!("CIP connection closed");
        self.shutdown();
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        let _ = rx.wait_for(|&closed| closed).await;
    }

    fn handle(&self, packet: Packet) -> Result<(), ConnectionError> {
        trace!(kind = ?packet.kind, len = packet.payload.len(), "rx");
        let actions = self
            .write()
            .session
            .on_packet(&packet, &self.inner.joins)?;
        self.perform(actions)
    }

    fn perform(&self, actions: Vec<SessionAction>) -> Result<(), ConnectionError> {
        for action in actions {
            match action {
                SessionAction::Send(bytes) => self.send_frame(bytes)?,
                SessionAction::SyncOutbound => self.resync()?,
            }
        }
        Ok(())
    }

    /// Queue every outbound value for this peer only, batched into Update packets.
    fn resync(&self) -> Result<(), ConnectionError> {
        let tasks: Vec<UpdateTask> = self
            .inner
            .joins
            .outbound_snapshot()
            .iter()
            .filter_map(|t| match UpdateTask::from_transition(t) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(join = %t.join, error = %e, "cannot sync value");
                    None
                }
            })
            .collect();
        debug!(count = tasks.len(), "sync");
        match encode_update(&tasks) {
            Ok(packets) => {
                for p in packets {
                    self.send_frame(p)?;
                }
            }
            Err(e) => warn!(error = %e, "sync encoding failed"),
        }
        Ok(())
    }

    fn send_frame(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.inner
            .frames
            .send(bytes)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Wire bytes for an outbound transition, or `None` if it cannot or should not be sent.
    fn encode_outbound(&self, t: &Transition) -> Option<Vec<u8>> {
        if self.state() < ConnState::AwaitingSync {
            trace!(join = %t.join, "not online yet; transition left to sync");
            return None;
        }
        match encode_transition(t) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(join = %t.join, error = %e, "cannot send transition");
                None
            }
        }
    }

    /// The single failure path: close, record the error, stop both tasks.
    fn fail(&self, err: ConnectionError) {
        {
            let mut shared = self.write();
            if shared.session.is_closed() {
                return;
            }
            warn!(error = %err, "CIP connection failed");
            shared.session.close();
            shared.last_error = Some(Arc::new(err));
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        self.inner.joins.detach(self.inner.subscriber);
        self.inner.shutdown.send_replace(true);
    }

    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.inner
            .shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.inner
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

/// Read one packet. `Ok(None)` on a clean end of stream at a packet boundary.
async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Packet>, ConnectionError> {
    let mut header = [0u8; HEADER_SIZE];
    if r.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    r.read_exact(&mut header[1..]).await.map_err(short_read)?;
    let (kind, len) = parse_header(header);
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(short_read)?;
    let packet = Packet::from_parts(kind, payload).map_err(SessionError::from)?;
    Ok(Some(packet))
}

fn short_read(e: io::Error) -> ConnectionError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ConnectionError::ShortRead
    } else {
        ConnectionError::Io(e)
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: Connection,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            r = read_packet(&mut reader) => r,
            _ = shutdown.wait_for(|&closed| closed) => return,
        };
        match packet {
            Ok(Some(p)) => {
                if let Err(e) = conn.handle(p) {
                    conn.fail(e);
                    return;
                }
            }
            Ok(None) => {
                debug!("peer closed the stream");
                conn.close();
                return;
            }
            Err(e) => {
                conn.fail(e);
                return;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    conn: Connection,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut transitions: mpsc::Receiver<Transition>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = shutdown.wait_for(|&closed| closed) => break,
            Some(frame) = frames.recv() => frame,
            Some(t) = transitions.recv() => match conn.encode_outbound(&t) {
                Some(bytes) => bytes,
                None => continue,
            },
            else => break,
        };
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            conn.fail(e.into());
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn ping_loop(conn: Connection, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|&closed| closed) => return,
            _ = ticker.tick() => {
                if conn.send_ping().is_err() {
                    return;
                }
            }
        }
    }
}

async fn handshake_deadline(conn: Connection, timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.wait_for(|&closed| closed) => {}
        _ = tokio::time::sleep(timeout) => {
            if conn.state() < ConnState::Ready {
                conn.fail(ConnectionError::HandshakeTimeout(timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cip_core::task::{decode_tasks, SyncKind};
    use cip_core::{Direction, Join, PacketType};
    use tokio::io::DuplexStream;

    const ONLINE_REQUEST: [u8; 10] = [0x01, 0x00, 0x07, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x03, 0x40];
    const WAIT: Duration = Duration::from_secs(5);

    fn join(n: u16) -> Join {
        Join::new(n).unwrap()
    }

    async fn next_packet(r: &mut DuplexStream) -> Packet {
        tokio::time::timeout(WAIT, read_packet(r))
            .await
            .expect("timed out waiting for packet")
            .unwrap()
            .expect("stream closed")
    }

    async fn read_bytes(r: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(WAIT, r.read_exact(&mut buf))
            .await
            .expect("timed out reading")
            .unwrap();
        buf
    }

    async fn wait_closed(conn: &Connection) {
        tokio::time::timeout(WAIT, conn.closed())
            .await
            .expect("connection did not close");
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Round-trip a ping so every packet sent before it has been handled.
    async fn barrier(remote: &mut DuplexStream) {
        remote.write_all(&wire::ping([0x55, 0xaa])).await.unwrap();
        loop {
            let p = next_packet(remote).await;
            if p.kind == PacketType::Pong && p.payload == [0x55, 0xaa] {
                return;
            }
        }
    }

    /// Drive a client connection to ready. Returns the peer end of the stream.
    async fn ready_client(joins: Arc<Joins>) -> (Connection, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let conn = Connection::client(local, Ipid(0x03), joins, ConnectionConfig::default());
        assert_eq!(read_bytes(&mut remote, 10).await, ONLINE_REQUEST);
        remote.write_all(&wire::hello()).await.unwrap();
        remote.write_all(&wire::online_ok()).await.unwrap();
        assert_eq!(
            read_bytes(&mut remote, 8).await,
            cip_core::task::sync_request()
        );
        let mut complete = Vec::new();
        UpdateTask::Sync(SyncKind::Complete)
            .encode_into(&mut complete)
            .unwrap();
        remote
            .write_all(&wire::encode_packet(PacketType::Update, &complete).unwrap())
            .await
            .unwrap();
        barrier(&mut remote).await;
        assert_eq!(conn.state(), ConnState::Ready);
        (conn, remote)
    }

    #[tokio::test]
    async fn host_answers_online_request() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, Arc::new(Joins::new()), ConnectionConfig::default());
        assert_eq!(conn.state(), ConnState::New);
        remote.write_all(&ONLINE_REQUEST).await.unwrap();
        assert_eq!(read_bytes(&mut remote, 4).await, [0x0f, 0x00, 0x01, 0x02]);
        assert_eq!(
            read_bytes(&mut remote, 7).await,
            [0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x03]
        );
        wait_until(|| conn.state() == ConnState::AwaitingSync).await;
        assert_eq!(conn.peer_ipid(), Ipid(0x03));
    }

    #[tokio::test]
    async fn client_syncs_after_online_ok() {
        let joins = Arc::new(Joins::new());
        let (conn, _remote) = ready_client(joins).await;
        assert!(conn.last_error().is_none());
    }

    #[tokio::test]
    async fn set_values_reach_the_wire() {
        let joins = Arc::new(Joins::new());
        let (_conn, mut remote) = ready_client(joins.clone()).await;
        joins.set_digital(join(5), true);
        joins.set_analog(join(10), 300);
        let mut got = Vec::new();
        while got.len() < 2 {
            let p = next_packet(&mut remote).await;
            assert_eq!(p.kind, PacketType::Update);
            got.extend(
                decode_tasks(&p.payload)
                    .unwrap()
                    .iter()
                    .filter_map(UpdateTask::transition),
            );
        }
        assert_eq!(
            got,
            vec![
                Transition::digital(join(5), true),
                Transition::analog(join(10), 300)
            ]
        );
    }

    #[tokio::test]
    async fn host_resyncs_on_sync_request() {
        let joins = Arc::new(Joins::new());
        joins.set_digital(join(7), true);
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, joins, ConnectionConfig::default());
        remote.write_all(&ONLINE_REQUEST).await.unwrap();
        read_bytes(&mut remote, 11).await;
        remote.write_all(&cip_core::task::sync_request()).await.unwrap();

        let p = next_packet(&mut remote).await;
        assert_eq!(
            decode_tasks(&p.payload).unwrap(),
            vec![UpdateTask::Digital { join: join(7), value: true }]
        );
        let p = next_packet(&mut remote).await;
        assert_eq!(
            decode_tasks(&p.payload).unwrap(),
            vec![UpdateTask::Sync(SyncKind::Request)]
        );
        wait_until(|| conn.state() == ConnState::Ready).await;
    }

    #[tokio::test]
    async fn inbound_updates_applied() {
        let joins = Arc::new(Joins::new());
        let (_conn, mut remote) = ready_client(joins.clone()).await;
        let packets = encode_update(&[
            UpdateTask::Digital { join: join(2), value: true },
            UpdateTask::Analog { join: join(3), value: 999 },
        ])
        .unwrap();
        remote.write_all(&packets[0]).await.unwrap();
        barrier(&mut remote).await;
        assert_eq!(joins.digital(Direction::Inbound, join(2)), Some(true));
        assert_eq!(joins.analog(Direction::Inbound, join(3)), Some(999));
    }

    #[tokio::test]
    async fn malformed_online_request_closes() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, Arc::new(Joins::new()), ConnectionConfig::default());
        remote
            .write_all(&[0x01, 0x00, 0x05, 0x7f, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();
        wait_closed(&conn).await;
        assert_eq!(conn.state(), ConnState::Closed);
        let err = conn.last_error().expect("error recorded");
        assert!(matches!(
            *err,
            ConnectionError::Session(SessionError::MalformedPacket { .. })
        ));
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty(), "no hello after a malformed request");
    }

    #[tokio::test]
    async fn unknown_packet_type_closes() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, Arc::new(Joins::new()), ConnectionConfig::default());
        remote.write_all(&[0x42, 0x00, 0x01, 0x00]).await.unwrap();
        wait_closed(&conn).await;
        assert!(matches!(
            *conn.last_error().unwrap(),
            ConnectionError::Session(SessionError::Packet(_))
        ));
    }

    #[tokio::test]
    async fn truncated_packet_is_short_read() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, Arc::new(Joins::new()), ConnectionConfig::default());
        remote.write_all(&[0x05, 0x00, 0x10, 0x00]).await.unwrap();
        drop(remote);
        wait_closed(&conn).await;
        assert!(matches!(
            *conn.last_error().unwrap(),
            ConnectionError::ShortRead
        ));
    }

    #[tokio::test]
    async fn clean_eof_closes_without_error() {
        let joins = Arc::new(Joins::new());
        let (conn, remote) = ready_client(joins.clone()).await;
        assert_eq!(joins.subscriber_count(), 1);
        drop(remote);
        wait_closed(&conn).await;
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.last_error().is_none());
        assert_eq!(joins.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn ping_echoed_and_recorded() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::host(local, Arc::new(Joins::new()), ConnectionConfig::default());
        assert!(conn.status().ends_with("(no heartbeats)"));
        remote.write_all(&wire::ping([0x01, 0x02])).await.unwrap();
        assert_eq!(read_bytes(&mut remote, 5).await, wire::pong(&[0x01, 0x02]));
        assert!(conn.last_heartbeat().is_some());
        assert!(conn.status().contains("last heartbeat"));
        assert_eq!(conn.state(), ConnState::New);
    }

    #[tokio::test]
    async fn periodic_ping() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let config = ConnectionConfig {
            ping_interval: Some(Duration::from_millis(20)),
            ..ConnectionConfig::default()
        };
        let _conn = Connection::host(local, Arc::new(Joins::new()), config);
        let p = next_packet(&mut remote).await;
        assert_eq!(p.kind, PacketType::Ping);
        assert_eq!(p.payload, [0, 0]);
    }

    #[tokio::test]
    async fn handshake_timeout_closes() {
        let (local, _remote) = tokio::io::duplex(4096);
        let config = ConnectionConfig {
            handshake_timeout: Some(Duration::from_millis(30)),
            ..ConnectionConfig::default()
        };
        let conn = Connection::host(local, Arc::new(Joins::new()), config);
        wait_closed(&conn).await;
        assert!(matches!(
            *conn.last_error().unwrap(),
            ConnectionError::HandshakeTimeout(_)
        ));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let joins = Arc::new(Joins::new());
        let (conn, mut remote) = ready_client(joins).await;
        conn.close();
        wait_closed(&conn).await;
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.last_error().is_none());
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dial_rejects_bad_ipid_before_io() {
        for ipid in [0x00, 0x01, 0x02, 0xff] {
            let err = dial("tcp", "unresolvable.invalid:41794", Ipid(ipid))
                .await
                .unwrap_err();
            assert!(matches!(err, ConnectionError::InvalidIpid(_)));
        }
        let err = dial("udp", "127.0.0.1:41794", Ipid(0x03)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidNetwork(_)));
    }

    #[tokio::test]
    async fn dial_and_accept_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let host_joins = Arc::new(Joins::new());
        let client_joins = Arc::new(Joins::new());
        host_joins.set_analog(join(1), 1234);
        client_joins.set_digital(join(4), true);

        let accept_joins = host_joins.clone();
        let host_task = tokio::spawn(async move {
            accept_with_joins(&listener, accept_joins, ConnectionConfig::default()).await
        });
        let client = dial_with_joins(
            "tcp4",
            &addr,
            Ipid(0x0a),
            client_joins.clone(),
            ConnectionConfig::default(),
        )
        .await
        .unwrap();
        let host = host_task.await.unwrap().unwrap();

        wait_until(|| host.state() == ConnState::Ready && client.state() == ConnState::Ready)
            .await;
        assert_eq!(host.peer_ipid(), Ipid(0x0a));
        wait_until(|| {
            host_joins.digital(Direction::Inbound, join(4)) == Some(true)
                && client_joins.analog(Direction::Inbound, join(1)) == Some(1234)
        })
        .await;

        client_joins.set_analog(join(2), 77);
        wait_until(|| host_joins.analog(Direction::Inbound, join(2)) == Some(77)).await;

        client.close();
        wait_closed(&host).await;
        assert!(host.last_error().is_none());
    }
}
