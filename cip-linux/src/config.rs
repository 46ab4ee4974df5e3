//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use cip_core::{Ipid, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};

use crate::connection::ConnectionConfig;

/// Which side of the link the daemon runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Listen and serve every client against one shared signal table.
    Host,
    /// Dial a host and keep redialing when the link drops.
    Client,
}

/// Daemon configuration. File: ~/.config/cip/config.toml or /etc/cip/config.toml.
/// Env overrides: CIP_ROLE, CIP_ADDRESS, CIP_PORT, CIP_IPID, CIP_PING_INTERVAL_SECS,
/// CIP_HANDSHAKE_TIMEOUT_SECS, CIP_OUTBOUND_QUEUE, CIP_RECONNECT_DELAY_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// host or client (default client).
    #[serde(default = "default_role")]
    pub role: Mode,
    /// Host address to dial, or address to listen on (default 127.0.0.1).
    #[serde(default = "default_address")]
    pub address: String,
    /// CIP port (default 41794).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Our IPID when dialing (default 0x03).
    #[serde(default = "default_ipid")]
    pub ipid: Ipid,
    /// Seconds between pings; 0 disables (default 15).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds allowed for the handshake; 0 disables (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Outbound transition queue per connection (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds to wait before redialing (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_role() -> Mode {
    Mode::Client
}
fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_ipid() -> Ipid {
    Ipid::MIN_CLIENT
}
fn default_ping_interval() -> u64 {
    15
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_outbound_queue() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_reconnect_delay() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            address: default_address(),
            port: default_port(),
            ipid: default_ipid(),
            ping_interval_secs: default_ping_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            outbound_queue: default_outbound_queue(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Config {
    /// `address:port`, bracketing bare IPv6 addresses.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_queue: self.outbound_queue,
            ping_interval: secs(self.ping_interval_secs),
            handshake_timeout: secs(self.handshake_timeout_secs),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(s) = get("CIP_ROLE") {
            match s.to_ascii_lowercase().as_str() {
                "host" => self.role = Mode::Host,
                "client" => self.role = Mode::Client,
                _ => {}
            }
        }
        if let Some(s) = get("CIP_ADDRESS") {
            self.address = s;
        }
        if let Some(p) = get("CIP_PORT").and_then(|s| s.parse().ok()) {
            self.port = p;
        }
        if let Some(i) = get("CIP_IPID").and_then(|s| parse_ipid(&s)) {
            self.ipid = i;
        }
        if let Some(n) = get("CIP_PING_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.ping_interval_secs = n;
        }
        if let Some(n) = get("CIP_HANDSHAKE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.handshake_timeout_secs = n;
        }
        if let Some(n) = get("CIP_OUTBOUND_QUEUE").and_then(|s| s.parse().ok()) {
            self.outbound_queue = n;
        }
        if let Some(n) = get("CIP_RECONNECT_DELAY_SECS").and_then(|s| s.parse().ok()) {
            self.reconnect_delay_secs = n;
        }
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

/// IPID as decimal or `0x`-prefixed hex.
fn parse_ipid(s: &str) -> Option<Ipid> {
    let s = s.trim();
    let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok()?,
        None => s.parse().ok()?,
    };
    Some(Ipid(v))
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cip/config.toml"));
    }
    out.push(PathBuf::from("/etc/cip/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
