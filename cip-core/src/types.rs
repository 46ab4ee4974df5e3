//! Signal value types, joins and IPIDs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A digital signal: high or low. `false` is never stored.
pub type Digital = bool;

/// A 16-bit analog signal. Signedness is up to the application. `0` is never stored.
pub type Analog = u16;

/// A serial signal: a run of bytes. Empty is never stored. Receivers must treat
/// serials as ephemeral; a later read may find the value gone.
pub type Serial = Vec<u8>;

/// Platform limit on serial length.
pub const MAX_SERIAL_LEN: usize = 255;

/// 1-based index of a signal slot. Joins of different types never alias.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Join(u16);

impl Join {
    /// Create a join. Returns `None` for 0.
    pub fn new(n: u16) -> Option<Self> {
        (n != 0).then_some(Join(n))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Zero-based wire index (`join - 1`).
    pub(crate) fn index(self) -> u16 {
        self.0 - 1
    }

    /// Join from a zero-based wire index. Wire index 0xFFFF has no join.
    pub(crate) fn from_index(index: u16) -> Option<Self> {
        index.checked_add(1).map(Join)
    }
}

impl TryFrom<u16> for Join {
    type Error = InvalidJoin;

    fn try_from(n: u16) -> Result<Self, Self::Error> {
        Join::new(n).ok_or(InvalidJoin)
    }
}

impl From<Join> for u16 {
    fn from(j: Join) -> u16 {
        j.0
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("join numbers are 1-based")]
pub struct InvalidJoin;

/// 8-bit peer identifier exchanged in the online request. Hosts are
/// conventionally 0x02; clients use 0x03 through 0xFE.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipid(pub u8);

impl Ipid {
    pub const HOST: Ipid = Ipid(0x02);
    pub const MIN_CLIENT: Ipid = Ipid(0x03);
    pub const MAX_CLIENT: Ipid = Ipid(0xfe);

    /// Whether this IPID may be used by a dialing client.
    pub fn is_valid_client(self) -> bool {
        (Self::MIN_CLIENT.0..=Self::MAX_CLIENT.0).contains(&self.0)
    }
}

impl fmt::Display for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Which way a value travels relative to this end of the link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Destined to the peer.
    Outbound,
}

/// A signal value of any type.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Signal {
    Digital(Digital),
    Analog(Analog),
    Serial(Serial),
}

/// A single change of one join. Immutable once built.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Transition {
    pub join: Join,
    pub signal: Signal,
}

impl Transition {
    pub fn digital(join: Join, value: Digital) -> Self {
        Self {
            join,
            signal: Signal::Digital(value),
        }
    }

    pub fn analog(join: Join, value: Analog) -> Self {
        Self {
            join,
            signal: Signal::Analog(value),
        }
    }

    pub fn serial(join: Join, value: Serial) -> Self {
        Self {
            join,
            signal: Signal::Serial(value),
        }
    }
}
