//! Session state machine. Host-driven: no I/O; the transport feeds packets in and
//! performs the returned actions.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::joins::Joins;
use crate::task::{self, SyncKind, TaskDecodeError, UpdateTask};
use crate::types::Ipid;
use crate::wire::{
    self, Packet, PacketDecodeError, PacketType, HELLO_PAYLOAD, ONLINE_OK_PAYLOAD,
    ONLINE_REQUEST_LEAD_IN, ONLINE_REQUEST_TRAILER,
};

const ONLINE_REQUEST_LEN: usize = 7;
const ONLINE_REQUEST_IPID: usize = 5;
const HEARTBEAT_LEN: usize = 2;

/// Which end of the link this session is.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// Control processor; accepts connections.
    Host,
    /// Supplicant device; dials the host.
    Client,
}

/// Handshake progress. Ordered: a session only ever moves to a later state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConnState {
    New,
    GotOnlineRequest,
    SentHello,
    AwaitingHello,
    AwaitingOnlineOk,
    AwaitingSync,
    Ready,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::New => "new",
            ConnState::GotOnlineRequest => "got online request",
            ConnState::SentHello => "sent hello",
            ConnState::AwaitingHello => "awaiting hello",
            ConnState::AwaitingOnlineOk => "awaiting online ok",
            ConnState::AwaitingSync => "awaiting sync",
            ConnState::Ready => "ready",
            ConnState::Closed => "closed",
        })
    }
}

/// What the transport must do after a packet was handled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionAction {
    /// Write these bytes (one or more whole packets).
    Send(Vec<u8>),
    /// Send every current outbound value to the peer.
    SyncOutbound,
}

/// Fatal protocol errors. The connection must close.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("malformed packet: {kind:?} with {len} byte payload")]
    MalformedPacket { kind: PacketType, len: usize },
    #[error(transparent)]
    Packet(#[from] PacketDecodeError),
    #[error(transparent)]
    Task(#[from] TaskDecodeError),
}

/// Session state for one CIP link.
#[derive(Debug, Clone)]
pub struct Session {
    role: Role,
    state: ConnState,
    /// Client IPID of the link: our own when dialing, the peer's once a host hears it.
    ipid: Ipid,
    last_heartbeat: Option<Instant>,
}

impl Session {
    /// Session for a client announcing `ipid`.
    pub fn client(ipid: Ipid) -> Self {
        Self {
            role: Role::Client,
            state: ConnState::New,
            ipid,
            last_heartbeat: None,
        }
    }

    /// Session for a host waiting for an online request.
    pub fn host() -> Self {
        Self {
            role: Role::Host,
            state: ConnState::New,
            ipid: Ipid::default(),
            last_heartbeat: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn ipid(&self) -> Ipid {
        self.ipid
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn since_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// First packets once the stream is open. Clients send the online request; hosts wait.
    pub fn start(&mut self) -> Vec<SessionAction> {
        match self.role {
            Role::Client if self.state == ConnState::New => {
                self.advance(ConnState::AwaitingHello);
                vec![SessionAction::Send(wire::online_request(self.ipid))]
            }
            _ => Vec::new(),
        }
    }

    /// Mark the session closed. Terminal.
    pub fn close(&mut self) {
        self.advance(ConnState::Closed);
    }

    /// Handle one packet from the peer.
    pub fn on_packet(
        &mut self,
        packet: &Packet,
        joins: &Joins,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.is_closed() {
            return Ok(Vec::new());
        }
        let p = packet.payload.as_slice();
        match packet.kind {
            PacketType::OnlineRequest => self.on_online_request(p),
            PacketType::Hello => Ok(self.on_hello(p)),
            PacketType::OnlineOk => Ok(self.on_online_ok(p)),
            PacketType::Update => self.on_update(p, joins),
            PacketType::Ping => {
                self.heartbeat(p);
                Ok(vec![SessionAction::Send(wire::pong(p))])
            }
            PacketType::Pong => {
                self.heartbeat(p);
                Ok(Vec::new())
            }
        }
    }

    fn on_online_request(&mut self, p: &[u8]) -> Result<Vec<SessionAction>, SessionError> {
        if self.role != Role::Host {
            warn!("online request received by a client; ignored");
            return Ok(Vec::new());
        }
        if p.len() <= ONLINE_REQUEST_IPID {
            return Err(SessionError::MalformedPacket {
                kind: PacketType::OnlineRequest,
                len: p.len(),
            });
        }
        if self.state != ConnState::New {
            warn!(state = %self.state, "repeated online request; ignored");
            return Ok(Vec::new());
        }
        if p.len() != ONLINE_REQUEST_LEN {
            warn!(len = p.len(), "unexpected online request payload length");
        } else if p[..ONLINE_REQUEST_IPID] != ONLINE_REQUEST_LEAD_IN
            || p[ONLINE_REQUEST_LEN - 1] != ONLINE_REQUEST_TRAILER
        {
            warn!(payload = ?p, "unexpected online request payload");
        }
        self.ipid = Ipid(p[ONLINE_REQUEST_IPID]);
        debug!(ipid = %self.ipid, "online request");
        self.advance(ConnState::GotOnlineRequest);
        let mut actions = vec![SessionAction::Send(wire::hello())];
        self.advance(ConnState::SentHello);
        actions.push(SessionAction::Send(wire::online_ok()));
        self.advance(ConnState::AwaitingSync);
        Ok(actions)
    }

    fn on_hello(&mut self, p: &[u8]) -> Vec<SessionAction> {
        if self.role != Role::Client {
            warn!("hello received by a host; ignored");
            return Vec::new();
        }
        if p != HELLO_PAYLOAD {
            warn!(payload = ?p, "unexpected hello payload");
        }
        self.advance(ConnState::AwaitingOnlineOk);
        Vec::new()
    }

    fn on_online_ok(&mut self, p: &[u8]) -> Vec<SessionAction> {
        if self.role != Role::Client {
            warn!("online ok received by a host; ignored");
            return Vec::new();
        }
        if p != ONLINE_OK_PAYLOAD {
            warn!(payload = ?p, "unexpected online ok payload");
        }
        if self.advance(ConnState::AwaitingSync) {
            vec![SessionAction::Send(task::sync_request())]
        } else {
            Vec::new()
        }
    }

    fn on_update(&mut self, p: &[u8], joins: &Joins) -> Result<Vec<SessionAction>, SessionError> {
        let mut actions = Vec::new();
        for t in task::decode_tasks(p)? {
            match t {
                UpdateTask::Sync(SyncKind::Request) => {
                    actions.push(SessionAction::SyncOutbound);
                    if self.state == ConnState::AwaitingSync {
                        self.advance(ConnState::Ready);
                        actions.push(SessionAction::Send(task::sync_request()));
                    }
                }
                UpdateTask::Sync(SyncKind::Complete) => {
                    if self.state == ConnState::AwaitingSync {
                        self.advance(ConnState::Ready);
                    }
                }
                UpdateTask::Sync(SyncKind::Other(v)) => {
                    warn!(value = v, "unknown sync task value");
                }
                UpdateTask::Digital { join, value } => {
                    trace!(%join, value, "digital in");
                    joins.digital_in(join, value);
                }
                UpdateTask::Analog { join, value } => {
                    trace!(%join, value, "analog in");
                    joins.analog_in(join, value);
                }
                UpdateTask::Serial { raw } => {
                    warn!(payload = ?raw, "serial update task unimplemented");
                }
                UpdateTask::Time { .. } => {}
                UpdateTask::Unknown { kind, payload } => {
                    warn!(kind, len = payload.len() + 1, "unimplemented update task");
                }
                UpdateTask::Malformed { .. } => {}
            }
        }
        Ok(actions)
    }

    fn heartbeat(&mut self, p: &[u8]) {
        if p.len() != HEARTBEAT_LEN {
            warn!(len = p.len(), "unexpected heartbeat payload length");
        }
        self.last_heartbeat = Some(Instant::now());
    }

    /// Move to `next` if it is later than the current state. Returns whether it moved.
    fn advance(&mut self, next: ConnState) -> bool {
        if next <= self.state {
            if self.state != ConnState::Closed {
                debug!(from = %self.state, to = %next, "ignoring backwards state change");
            }
            return false;
        }
        debug!(from = %self.state, to = %next, "state");
        self.state = next;
        true
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CIP connection state: {} IPID={}", self.state, self.ipid)?;
        match self.since_heartbeat() {
            Some(d) => write!(f, " last heartbeat: {:?}", d),
            None => f.write_str(" (no heartbeats)"),
        }
    }
}
