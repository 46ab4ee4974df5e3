//! CIP session engine on tokio: dial a host or accept clients, and keep a shared
//! [`Joins`](cip_core::Joins) in sync with the peer.

pub mod config;
pub mod connection;

pub use cip_core;
pub use connection::{
    accept, accept_with_joins, dial, dial_with_joins, Connection, ConnectionConfig,
    ConnectionError,
};
