//! Update tasks: the sub-messages carried inside an Update packet.
//!
//! Each task is framed as `reserved (0x00) | length (u16 BE) | payload`, and the first
//! payload byte selects the task kind:
//!
//! ```text
//! 03 ss             sync: ss = 00 request, 16 complete
//! 00|27 lo hi       digital: join = 1 + ((hi & 0x0f) << 8 | lo), on when hi & 0x80 is clear
//! 14 jh jl vh vl    analog: join = 1 + (jh << 8 | jl), value = vh << 8 | vl
//! 15 ...            serial (not decoded)
//! 08 ...            time (not decoded)
//! ```
//!
//! Unknown or malformed tasks are skipped by their declared length so the rest of the
//! packet still parses. Only a task that runs past the end of the packet is an error.

use tracing::warn;

use crate::types::{Join, Signal, Transition};
use crate::wire::{self, PacketType, MAX_PAYLOAD_LEN};

const TASK_HEADER_SIZE: usize = 3;

const KIND_DIGITAL: u8 = 0x00;
const KIND_DIGITAL_ALT: u8 = 0x27;
const KIND_SYNC: u8 = 0x03;
const KIND_TIME: u8 = 0x08;
const KIND_ANALOG: u8 = 0x14;
const KIND_SERIAL: u8 = 0x15;

const SYNC_REQUEST: u8 = 0x00;
const SYNC_COMPLETE: u8 = 0x16;

const DIGITAL_LEN: usize = 3;
const ANALOG_LEN: usize = 5;
const SYNC_LEN: usize = 2;

/// Largest join a digital task can address (12-bit index).
pub const MAX_DIGITAL_JOIN: u16 = 0x1000;

const DIGITAL_OFF: u8 = 0x80;

/// Sync control values.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncKind {
    /// Peer asks for a full resend of our outbound state.
    Request,
    /// Peer finished its sync.
    Complete,
    /// Anything else; ignored.
    Other(u8),
}

/// One decoded update task.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpdateTask {
    Sync(SyncKind),
    Digital { join: Join, value: bool },
    Analog { join: Join, value: u16 },
    /// Serial payload after the kind byte; the layout is not decoded.
    Serial { raw: Vec<u8> },
    /// Time payload after the kind byte; not interpreted.
    Time { raw: Vec<u8> },
    /// A kind this implementation does not handle.
    Unknown { kind: u8, payload: Vec<u8> },
    /// A known kind whose payload could not be parsed (empty or too short).
    Malformed { payload: Vec<u8> },
}

impl UpdateTask {
    /// Task carrying a signal transition. Serial transitions have no wire encoding yet.
    pub fn from_transition(t: &Transition) -> Result<Self, TaskEncodeError> {
        match &t.signal {
            Signal::Digital(value) => {
                if t.join.get() > MAX_DIGITAL_JOIN {
                    return Err(TaskEncodeError::JoinOutOfRange(t.join));
                }
                Ok(UpdateTask::Digital {
                    join: t.join,
                    value: *value,
                })
            }
            Signal::Analog(value) => Ok(UpdateTask::Analog {
                join: t.join,
                value: *value,
            }),
            Signal::Serial(_) => Err(TaskEncodeError::Unimplemented("serial")),
        }
    }

    /// The transition this task carries, if it is a digital or analog update.
    pub fn transition(&self) -> Option<Transition> {
        match *self {
            UpdateTask::Digital { join, value } => Some(Transition::digital(join, value)),
            UpdateTask::Analog { join, value } => Some(Transition::analog(join, value)),
            _ => None,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, TaskEncodeError> {
        Ok(match self {
            UpdateTask::Sync(kind) => {
                let v = match kind {
                    SyncKind::Request => SYNC_REQUEST,
                    SyncKind::Complete => SYNC_COMPLETE,
                    SyncKind::Other(v) => *v,
                };
                vec![KIND_SYNC, v]
            }
            UpdateTask::Digital { join, value } => {
                if join.get() > MAX_DIGITAL_JOIN {
                    return Err(TaskEncodeError::JoinOutOfRange(*join));
                }
                let index = join.index();
                let mut hi = ((index >> 8) as u8) & 0x0f;
                if !*value {
                    hi |= DIGITAL_OFF;
                }
                vec![KIND_DIGITAL, index as u8, hi]
            }
            UpdateTask::Analog { join, value } => {
                let [jh, jl] = join.index().to_be_bytes();
                let [vh, vl] = value.to_be_bytes();
                vec![KIND_ANALOG, jh, jl, vh, vl]
            }
            UpdateTask::Serial { raw } => prefixed(KIND_SERIAL, raw),
            UpdateTask::Time { raw } => prefixed(KIND_TIME, raw),
            UpdateTask::Unknown { kind, payload } => prefixed(*kind, payload),
            UpdateTask::Malformed { payload } => payload.clone(),
        })
    }

    /// Append this task, framed, to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), TaskEncodeError> {
        let payload = self.payload()?;
        if payload.len() > MAX_PAYLOAD_LEN - TASK_HEADER_SIZE {
            return Err(TaskEncodeError::TooLarge(payload.len()));
        }
        out.push(0x00);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }
}

fn prefixed(kind: u8, rest: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(1 + rest.len());
    p.push(kind);
    p.extend_from_slice(rest);
    p
}

/// Error encoding a task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskEncodeError {
    #[error("join {0} cannot be encoded in this task")]
    JoinOutOfRange(Join),
    #[error("{0} update tasks are not implemented")]
    Unimplemented(&'static str),
    #[error("task payload of {0} bytes does not fit an update packet")]
    TooLarge(usize),
}

/// Error decoding the task stream of an Update packet.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskDecodeError {
    #[error("update task truncated: needed {needed} bytes, {available} left")]
    ShortRead { needed: usize, available: usize },
}

/// Decode every task in an Update payload.
pub fn decode_tasks(mut payload: &[u8]) -> Result<Vec<UpdateTask>, TaskDecodeError> {
    let mut tasks = Vec::new();
    while !payload.is_empty() {
        if payload.len() < TASK_HEADER_SIZE {
            return Err(TaskDecodeError::ShortRead {
                needed: TASK_HEADER_SIZE,
                available: payload.len(),
            });
        }
        if payload[0] != 0x00 {
            warn!(reserved = payload[0], "unexpected update task reserved byte");
        }
        let len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        let rest = &payload[TASK_HEADER_SIZE..];
        if rest.len() < len {
            return Err(TaskDecodeError::ShortRead {
                needed: len,
                available: rest.len(),
            });
        }
        tasks.push(decode_task(&rest[..len]));
        payload = &rest[len..];
    }
    Ok(tasks)
}

fn decode_task(p: &[u8]) -> UpdateTask {
    let Some(&kind) = p.first() else {
        warn!("empty update task");
        return UpdateTask::Malformed { payload: Vec::new() };
    };
    match kind {
        KIND_SYNC => {
            if p.len() != SYNC_LEN {
                warn!(len = p.len(), "unexpected sync task payload length");
            }
            match p.get(1) {
                Some(&SYNC_REQUEST) => UpdateTask::Sync(SyncKind::Request),
                Some(&SYNC_COMPLETE) => UpdateTask::Sync(SyncKind::Complete),
                Some(&other) => UpdateTask::Sync(SyncKind::Other(other)),
                None => UpdateTask::Malformed { payload: p.to_vec() },
            }
        }
        KIND_DIGITAL | KIND_DIGITAL_ALT => {
            if p.len() != DIGITAL_LEN {
                warn!(len = p.len(), "unexpected digital task payload length");
            }
            if p.len() < DIGITAL_LEN {
                return UpdateTask::Malformed { payload: p.to_vec() };
            }
            let index = (((p[2] & 0x0f) as u16) << 8) | p[1] as u16;
            match Join::from_index(index) {
                Some(join) => UpdateTask::Digital {
                    join,
                    value: p[2] & DIGITAL_OFF == 0,
                },
                None => UpdateTask::Malformed { payload: p.to_vec() },
            }
        }
        KIND_ANALOG => {
            if p.len() != ANALOG_LEN {
                warn!(len = p.len(), "unexpected analog task payload length");
            }
            if p.len() < ANALOG_LEN {
                return UpdateTask::Malformed { payload: p.to_vec() };
            }
            let index = u16::from_be_bytes([p[1], p[2]]);
            let Some(join) = Join::from_index(index) else {
                warn!(index, "analog task join out of range");
                return UpdateTask::Malformed { payload: p.to_vec() };
            };
            UpdateTask::Analog {
                join,
                value: u16::from_be_bytes([p[3], p[4]]),
            }
        }
        KIND_SERIAL => UpdateTask::Serial { raw: p[1..].to_vec() },
        KIND_TIME => UpdateTask::Time { raw: p[1..].to_vec() },
        other => UpdateTask::Unknown {
            kind: other,
            payload: p[1..].to_vec(),
        },
    }
}

/// Encode tasks into as few Update packets as fit the 16-bit length.
pub fn encode_update(tasks: &[UpdateTask]) -> Result<Vec<Vec<u8>>, TaskEncodeError> {
    let mut packets = Vec::new();
    let mut payload = Vec::new();
    for task in tasks {
        let mut framed = Vec::new();
        task.encode_into(&mut framed)?;
        if payload.len() + framed.len() > MAX_PAYLOAD_LEN {
            packets.push(update_packet(&payload)?);
            payload.clear();
        }
        payload.extend_from_slice(&framed);
    }
    if !payload.is_empty() {
        packets.push(update_packet(&payload)?);
    }
    Ok(packets)
}

/// Encode a single transition as a complete Update packet.
pub fn encode_transition(t: &Transition) -> Result<Vec<u8>, TaskEncodeError> {
    let mut payload = Vec::new();
    UpdateTask::from_transition(t)?.encode_into(&mut payload)?;
    update_packet(&payload)
}

/// Update packet holding a single sync request.
pub fn sync_request() -> Vec<u8> {
    vec![
        PacketType::Update as u8,
        0x00,
        0x05,
        0x00,
        0x00,
        SYNC_LEN as u8,
        KIND_SYNC,
        SYNC_REQUEST,
    ]
}

fn update_packet(payload: &[u8]) -> Result<Vec<u8>, TaskEncodeError> {
    wire::encode_packet(PacketType::Update, payload)
        .map_err(|_| TaskEncodeError::TooLarge(payload.len()))
}
