//! Joins: the signal table shared between the wire and the application.
//!
//! Six independent maps, {digital, analog, serial} x {inbound, outbound}, each behind its
//! own lock. Absent entries mean the default value (`false`, `0`, empty), so defaults are
//! never stored.
//!
//! Outbound sets are fanned out to every attached subscriber (one per live connection)
//! through a bounded queue. A full queue drops the transition and counts it; with no
//! subscriber attached, transitions are discarded.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::types::{Analog, Digital, Direction, Join, Serial, Signal, Transition, MAX_SERIAL_LEN};

/// Default capacity of a subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const INBOUND_OBSERVER_CAPACITY: usize = 1024;

/// Handle identifying an attached outbound subscriber.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Transition>,
}

/// Current state of a CIP session, in both directions.
pub struct Joins {
    digital_in: RwLock<HashMap<Join, Digital>>,
    analog_in: RwLock<HashMap<Join, Analog>>,
    serial_in: RwLock<HashMap<Join, Serial>>,
    digital_out: RwLock<HashMap<Join, Digital>>,
    analog_out: RwLock<HashMap<Join, Analog>>,
    serial_out: RwLock<HashMap<Join, Serial>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    dropped: AtomicU64,
    inbound: broadcast::Sender<Transition>,
}

impl Default for Joins {
    fn default() -> Self {
        Self::new()
    }
}

impl Joins {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_OBSERVER_CAPACITY);
        Self {
            digital_in: RwLock::default(),
            analog_in: RwLock::default(),
            serial_in: RwLock::default(),
            digital_out: RwLock::default(),
            analog_out: RwLock::default(),
            serial_out: RwLock::default(),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            inbound,
        }
    }

    /// Set an outbound digital and send it to the peer, even if unchanged.
    pub fn set_digital(&self, join: Join, value: Digital) {
        store(&self.digital_out, join, value, |v| *v);
        self.emit(Transition::digital(join, value));
    }

    /// Set an outbound analog and send it to the peer, even if unchanged.
    pub fn set_analog(&self, join: Join, value: Analog) {
        store(&self.analog_out, join, value, |v| *v != 0);
        self.emit(Transition::analog(join, value));
    }

    /// Set an outbound serial and send it to the peer, even if unchanged.
    pub fn set_serial(&self, join: Join, value: Serial) {
        if value.len() > MAX_SERIAL_LEN {
            warn!(%join, len = value.len(), "serial longer than the platform limit");
        }
        store(&self.serial_out, join, value.clone(), |v| !v.is_empty());
        self.emit(Transition::serial(join, value));
    }

    /// Record a digital received from the peer.
    pub fn digital_in(&self, join: Join, value: Digital) {
        store(&self.digital_in, join, value, |v| *v);
        self.observe(Transition::digital(join, value));
    }

    /// Record an analog received from the peer.
    pub fn analog_in(&self, join: Join, value: Analog) {
        store(&self.analog_in, join, value, |v| *v != 0);
        self.observe(Transition::analog(join, value));
    }

    /// Record a serial received from the peer.
    pub fn serial_in(&self, join: Join, value: Serial) {
        store(&self.serial_in, join, value.clone(), |v| !v.is_empty());
        self.observe(Transition::serial(join, value));
    }

    /// Apply a transition received from the peer.
    pub fn apply_inbound(&self, t: Transition) {
        match t.signal {
            Signal::Digital(v) => self.digital_in(t.join, v),
            Signal::Analog(v) => self.analog_in(t.join, v),
            Signal::Serial(v) => self.serial_in(t.join, v),
        }
    }

    /// Digital value, or `None` when absent (low).
    pub fn digital(&self, direction: Direction, join: Join) -> Option<Digital> {
        let map = match direction {
            Direction::Inbound => &self.digital_in,
            Direction::Outbound => &self.digital_out,
        };
        read(map).get(&join).copied()
    }

    /// Analog value, or `None` when absent (zero).
    pub fn analog(&self, direction: Direction, join: Join) -> Option<Analog> {
        let map = match direction {
            Direction::Inbound => &self.analog_in,
            Direction::Outbound => &self.analog_out,
        };
        read(map).get(&join).copied()
    }

    /// Serial value, or `None` when absent (empty).
    pub fn serial(&self, direction: Direction, join: Join) -> Option<Serial> {
        let map = match direction {
            Direction::Inbound => &self.serial_in,
            Direction::Outbound => &self.serial_out,
        };
        read(map).get(&join).cloned()
    }

    /// Every outbound value currently present, as transitions.
    pub fn outbound_snapshot(&self) -> Vec<Transition> {
        let mut out: Vec<Transition> = read(&self.digital_out)
            .iter()
            .map(|(&j, &v)| Transition::digital(j, v))
            .collect();
        out.extend(
            read(&self.analog_out)
                .iter()
                .map(|(&j, &v)| Transition::analog(j, v)),
        );
        out.extend(
            read(&self.serial_out)
                .iter()
                .map(|(&j, v)| Transition::serial(j, v.clone())),
        );
        out
    }

    /// Resend every outbound value to all subscribers.
    pub fn sync(&self) {
        for t in self.outbound_snapshot() {
            self.emit(t);
        }
    }

    /// Attach an outbound subscriber with a queue of `capacity` transitions.
    pub fn attach(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Transition>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn detach(&self, id: SubscriberId) {
        lock(&self.subscribers).retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Transitions dropped because a subscriber queue was full.
    pub fn dropped_transitions(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Observe every inbound change. Slow observers lose the oldest entries.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Transition> {
        self.inbound.subscribe()
    }

    fn emit(&self, t: Transition) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|s| match s.tx.try_send(t.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(join = %t.join, "outbound queue full; transition dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn observe(&self, t: Transition) {
        // No observers is fine.
        let _ = self.inbound.send(t);
    }
}

fn store<K: Eq + Hash, V>(
    map: &RwLock<HashMap<K, V>>,
    key: K,
    value: V,
    present: impl Fn(&V) -> bool,
) {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    if present(&value) {
        map.insert(key, value);
    } else {
        map.remove(&key);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
