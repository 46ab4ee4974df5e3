//! CIP control-bus protocol core.
//! Host-driven: no I/O; the transport passes packets in and performs the returned actions.

pub mod joins;
pub mod session;
pub mod task;
pub mod types;
pub mod wire;

pub use joins::{Joins, SubscriberId, DEFAULT_QUEUE_CAPACITY};
pub use session::{ConnState, Role, Session, SessionAction, SessionError};
pub use task::{decode_tasks, encode_transition, encode_update, SyncKind, UpdateTask};
pub use types::{Analog, Digital, Direction, Ipid, Join, Serial, Signal, Transition};
pub use wire::{decode_packet, encode_packet, Packet, PacketDecodeError, PacketType};

/// Conventional host port.
pub const DEFAULT_PORT: u16 = 41794;
